// ABOUTME: Change events and the handler capabilities that receive them
// ABOUTME: Accept-event is mandatory; accept-final-watermark is an explicit optional capability

use std::io::Write;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::token::Watermark;
use crate::schema::ConnectorObject;

/// Deletions are invisible to timestamp polling, so there is only one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    CreateOrUpdate,
}

/// One discovered change.
///
/// `token` is the watermark captured before the scan started, identical for
/// every event of a scan, never the entry's own timestamp. Consumers must treat
/// events as idempotent notifications; the same entry can be delivered again
/// by the next scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub token: Watermark,
    pub object: ConnectorObject,
}

pub trait ChangeHandler {
    fn handle(&mut self, event: ChangeEvent) -> Result<()>;

    /// Capability probe for the final-watermark notification. Handlers that
    /// want it return `Some(self)`.
    fn final_watermark_handler(&mut self) -> Option<&mut dyn FinalWatermarkHandler> {
        None
    }
}

/// Receives the committed resume watermark once, after the last event of a
/// successful scan.
pub trait FinalWatermarkHandler {
    fn handle_final(&mut self, watermark: Watermark) -> Result<()>;
}

impl<H: ChangeHandler + ?Sized> ChangeHandler for &mut H {
    fn handle(&mut self, event: ChangeEvent) -> Result<()> {
        (**self).handle(event)
    }

    fn final_watermark_handler(&mut self) -> Option<&mut dyn FinalWatermarkHandler> {
        (**self).final_watermark_handler()
    }
}

/// Events-only handler around a closure.
pub struct EventFn<F>(pub F);

impl<F> ChangeHandler for EventFn<F>
where
    F: FnMut(ChangeEvent) -> Result<()>,
{
    fn handle(&mut self, event: ChangeEvent) -> Result<()> {
        (self.0)(event)
    }
}

#[derive(Debug, Default)]
pub struct CollectingHandler {
    pub events: Vec<ChangeEvent>,
    pub final_watermark: Option<Watermark>,
    pub final_notifications: usize,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uids(&self) -> Vec<&str> {
        self.events
            .iter()
            .map(|event| event.object.uid.as_str())
            .collect()
    }
}

impl ChangeHandler for CollectingHandler {
    fn handle(&mut self, event: ChangeEvent) -> Result<()> {
        self.events.push(event);
        Ok(())
    }

    fn final_watermark_handler(&mut self) -> Option<&mut dyn FinalWatermarkHandler> {
        Some(self)
    }
}

impl FinalWatermarkHandler for CollectingHandler {
    fn handle_final(&mut self, watermark: Watermark) -> Result<()> {
        self.final_watermark = Some(watermark);
        self.final_notifications += 1;
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Line<'a> {
    Change(&'a ChangeEvent),
    Token { token: Watermark },
}

/// Writes one JSON document per line: `{"type":"change",...}` for events and
/// `{"type":"token","token":"..."}` for the final watermark.
pub struct JsonLinesHandler<W: Write> {
    writer: W,
    events_written: u64,
}

impl<W: Write> JsonLinesHandler<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            events_written: 0,
        }
    }

    pub fn events_written(&self) -> u64 {
        self.events_written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line).context("Failed to encode change line")?;
        self.writer
            .write_all(b"\n")
            .context("Failed to write change line")?;
        self.writer.flush().context("Failed to flush change output")?;
        Ok(())
    }
}

impl<W: Write> ChangeHandler for JsonLinesHandler<W> {
    fn handle(&mut self, event: ChangeEvent) -> Result<()> {
        self.write_line(&Line::Change(&event))?;
        self.events_written += 1;
        Ok(())
    }

    fn final_watermark_handler(&mut self) -> Option<&mut dyn FinalWatermarkHandler> {
        Some(self)
    }
}

impl<W: Write> FinalWatermarkHandler for JsonLinesHandler<W> {
    fn handle_final(&mut self, watermark: Watermark) -> Result<()> {
        self.write_line(&Line::Token { token: watermark })
    }
}
