use std::time::Duration;

use metrics::counter;
use metrics::histogram;

/// Per-command counters, next to the transaction metrics recorded by
/// `mefs-contracts`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics {}

impl Metrics {
    pub fn new() -> Self {
        Self {}
    }

    pub fn increment_commands_run(
        &self,
        command: &'static str,
    ) {
        counter!("mefs_settle_commands_total", "command" => command).increment(1);
    }

    pub fn increment_commands_failed(
        &self,
        command: &'static str,
    ) {
        counter!("mefs_settle_commands_failed_total", "command" => command).increment(1);
    }

    pub fn observe_command_duration(
        &self,
        command: &'static str,
        duration: Duration,
    ) {
        histogram!("mefs_settle_command_duration_seconds", "command" => command)
            .record(duration.as_secs_f64());
    }
}
