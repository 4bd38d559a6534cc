// ABOUTME: Library root for directory-sync
// ABOUTME: Change polling over directory stores using modify/create timestamp watermarks

pub mod config;
pub mod directory;
pub mod schema;
pub mod sync;
