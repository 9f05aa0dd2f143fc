// Copyright (c) 2025 Graphcore Ltd. All rights reserved.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::tracker::{EntityManager, Track};
use crate::{Id, SharedWriter, Writer};

/// Format used for the wall-clock timestamp at the start of every line.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A simple text tracker to output messages to a Writer.
///
/// Each line starts with the wall-clock time and the full name of the entity
/// that emitted it, for example:
///
/// ```text
/// [2025-03-01 10:00:00] rank0::scheduler:INFO: phase 0 complete
/// ```
pub struct TextTracker {
    entity_manager: EntityManager,

    /// Writer to which all _log_ events will be written.
    writer: SharedWriter,
}

impl TextTracker {
    /// Create a new [`TextTracker`] with an [`EntityManager`].
    pub fn new(entity_manager: EntityManager, writer: Writer) -> Self {
        Self {
            entity_manager,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    fn write_line(&self, line: std::fmt::Arguments) {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let mut writer = self.writer.lock().unwrap();
        // Losing a log line must never stop the simulation.
        let _ = writer.write_fmt(format_args!("[{timestamp}] {line}\n"));
    }
}

/// Implementation for each [`Track`] event
impl Track for TextTracker {
    fn unique_id(&self) -> Id {
        self.entity_manager.unique_id()
    }

    fn is_entity_enabled(&self, id: Id, level: log::Level) -> bool {
        self.entity_manager.is_enabled(id, level)
    }

    fn add_entity(&self, id: Id, entity_name: &str) {
        self.entity_manager.add_entity(id, entity_name);
    }

    fn create(&self, created_by: Id, id: Id, num_bytes: usize, name: &str) {
        let by = self.entity_manager.name_of(created_by);
        self.write_line(format_args!(
            "{by}: created {id}, {name}, {num_bytes} bytes"
        ));
    }

    fn destroy(&self, destroyed_by: Id, id: Id) {
        let by = self.entity_manager.name_of(destroyed_by);
        self.write_line(format_args!("{by}: destroyed {id}"));
    }

    fn log(&self, id: Id, level: log::Level, msg: std::fmt::Arguments) {
        let name = self.entity_manager.name_of(id);
        self.write_line(format_args!("{name}:{level}: {msg}"));
    }

    fn time(&self, set_by: Id, time_ns: f64) {
        let name = self.entity_manager.name_of(set_by);
        self.write_line(format_args!("{name}: set time to {time_ns:.1}ns"));
    }

    fn shutdown(&self) {
        let _ = self.writer.lock().unwrap().flush();
    }
}
