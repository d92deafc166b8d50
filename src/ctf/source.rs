//! The CTF source component: the canonical producer, wrapping one
//! stream decoder per output port.

use std::rc::Rc;

use serde::Deserialize;
use tracing::debug;

use crate::ctf::decoder::{DecoderNext, StreamDecoder};
use crate::ctf::medium::Medium;
use crate::error::Error;
use crate::graph::component::{Params, PortSpec, Source};
use crate::graph::iterator::{IteratorContext, IteratorStatus, NotificationIterator};
use crate::graph::notification::Notification;
use crate::ir::trace::Trace;

/// Source configuration, merged from reflector-style kebab-case
/// metadata.
#[derive(Clone, Debug, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CtfSourceConfig {
    /// Overrides the trace name.
    pub trace_name: Option<String>,

    /// Nanoseconds added to every clock class offset.
    pub clock_class_offset_ns: Option<i64>,

    /// Seconds added to every clock class offset.
    pub clock_class_offset_s: Option<i64>,

    /// Forces every clock class origin to the Unix epoch.
    pub force_clock_class_origin_unix_epoch: Option<bool>,

    /// Largest byte request issued to a medium.
    pub max_request_len: Option<usize>,
}

/// A source feeding one trace's packet sequences into a graph, one
/// output port per medium.
pub struct CtfSource {
    trace: Rc<Trace>,
    config: CtfSourceConfig,
    media: Vec<(String, Option<Box<dyn Medium>>)>,
}

impl CtfSource {
    pub fn new(trace: Rc<Trace>, config: CtfSourceConfig) -> Self {
        Self {
            trace,
            config,
            media: Vec::new(),
        }
    }

    /// Registers a medium; the source declares an output port with the
    /// same name.
    pub fn add_stream_medium(&mut self, port: impl Into<String>, medium: Box<dyn Medium>) {
        self.media.push((port.into(), Some(medium)));
    }

    fn apply_clock_offsets(&self) -> Result<(), Error> {
        let offset_s = self.config.clock_class_offset_s.unwrap_or(0);
        let offset_ns = self.config.clock_class_offset_ns.unwrap_or(0);
        let force_unix_epoch = self
            .config
            .force_clock_class_origin_unix_epoch
            .unwrap_or(false);
        if offset_s == 0 && offset_ns == 0 && !force_unix_epoch {
            return Ok(());
        }
        for index in 0..self.trace.stream_class_count() {
            let Some(sc) = self.trace.stream_class_by_index(index) else {
                continue;
            };
            let Some(clock) = sc.default_clock_class() else {
                continue;
            };
            let (s, c) = clock.offset();
            let ns_as_cycles =
                (offset_ns as i128 * clock.frequency() as i128 / 1_000_000_000) as i64;
            clock.set_offset(s + offset_s, c.wrapping_add(ns_as_cycles as u64))?;
            if force_unix_epoch {
                clock.set_is_absolute(true)?;
            }
        }
        Ok(())
    }
}

impl Source for CtfSource {
    fn initialize(&mut self, _params: &Params, ports: &mut PortSpec) -> Result<(), Error> {
        if let Some(name) = &self.config.trace_name {
            self.trace.set_name(name.clone())?;
        }
        self.apply_clock_offsets()?;
        for (port, _) in &self.media {
            ports.add_output_port(port.clone());
        }
        debug!(ports = self.media.len(), "initialized CTF source");
        Ok(())
    }

    fn create_notification_iterator(
        &mut self,
        port: &str,
    ) -> Result<Box<dyn NotificationIterator>, Error> {
        let slot = self
            .media
            .iter_mut()
            .find(|(name, _)| name == port)
            .ok_or(Error::NotFound {
                kind: "output port",
                name: port.to_owned(),
            })?;
        let medium = slot.1.take().ok_or(Error::Component(format!(
            "an iterator was already created on port '{port}'"
        )))?;
        let decoder = match self.config.max_request_len {
            Some(len) => StreamDecoder::with_max_request_len(self.trace.clone(), medium, len)?,
            None => StreamDecoder::new(self.trace.clone(), medium)?,
        };
        Ok(Box::new(CtfIterator {
            decoder,
            pools_attached: false,
        }))
    }
}

/// Drives one decoder, translating its emissions into iterator
/// batches.
struct CtfIterator {
    decoder: StreamDecoder,
    pools_attached: bool,
}

impl NotificationIterator for CtfIterator {
    fn next(
        &mut self,
        ctx: &mut IteratorContext<'_>,
        batch: &mut Vec<Rc<Notification>>,
        capacity: usize,
    ) -> Result<IteratorStatus, Error> {
        if !self.pools_attached {
            self.decoder.set_notification_pools(ctx.notification_pools());
            self.pools_attached = true;
        }
        while batch.len() < capacity {
            match self.decoder.next()? {
                DecoderNext::Notification(n) => batch.push(n),
                DecoderNext::Again => {
                    return Ok(if batch.is_empty() {
                        IteratorStatus::Again
                    } else {
                        IteratorStatus::Ok
                    });
                }
                DecoderNext::End => {
                    return Ok(if batch.is_empty() {
                        IteratorStatus::End
                    } else {
                        IteratorStatus::Ok
                    });
                }
            }
        }
        Ok(IteratorStatus::Ok)
    }
}
