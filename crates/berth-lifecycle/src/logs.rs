//! Provisioning logs persisted next to the instance record.

use std::sync::Arc;

use berth_driver::InstanceLogSink;
use berth_state::{LogLevel, LogType, StateStore};
use tracing::{debug, warn};

use crate::clock::Clock;

/// Writes driver and engine audit lines into the record store.
///
/// A failed write never fails the operation being logged.
pub struct StoreLogSink {
    store: StateStore,
    instance_id: String,
    log_type: LogType,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl StoreLogSink {
    pub fn new(
        store: StateStore,
        instance_id: &str,
        log_type: LogType,
        clock: Arc<dyn Clock>,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            instance_id: instance_id.to_string(),
            log_type,
            clock,
            enabled,
        }
    }
}

impl InstanceLogSink for StoreLogSink {
    fn write(&self, level: LogLevel, message: &str) {
        debug!(instance_id = %self.instance_id, log_type = ?self.log_type, ?level, line = message, "instance log");
        if !self.enabled {
            return;
        }
        if let Err(e) = self.store.append_log(
            &self.instance_id,
            self.log_type,
            level,
            self.clock.now(),
            message,
        ) {
            warn!(instance_id = %self.instance_id, error = %e, "could not persist instance log line");
        }
    }
}
