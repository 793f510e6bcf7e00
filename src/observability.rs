use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotd_query_duration_seconds";

/// Counter: bookings rejected for overlapping a committed interval. Labels: kind.
pub const CONFLICTS_TOTAL: &str = "slotd_conflicts_total";

/// Counter: registrations rejected because the session was full.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "slotd_capacity_rejections_total";

/// Counter: recurring instances processed. Labels: outcome.
pub const SERIES_INSTANCES_TOTAL: &str = "slotd_series_instances_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotd_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotd_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "slotd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotd_wal_flush_batch_size";

/// Counter: WAL appends retried after a storage failure.
pub const WAL_APPEND_RETRIES_TOTAL: &str = "slotd_wal_append_retries_total";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "slotd_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::UpdateProvider { .. } => "update_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::InsertService { .. } => "insert_service",
        Command::UpdateService { .. } => "update_service",
        Command::UpsertDayRule { .. } => "upsert_day_rule",
        Command::DeleteDayRule { .. } => "delete_day_rule",
        Command::InsertBlockedRange { .. } => "insert_blocked_range",
        Command::DeleteBlockedRange { .. } => "delete_blocked_range",
        Command::InsertAppointment {
            recurrence: Some(_), ..
        } => "insert_series",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointmentStatus { .. } => "update_appointment_status",
        Command::RescheduleAppointment { .. } => "reschedule_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::InsertGroupSession { .. } => "insert_group_session",
        Command::CancelGroupSession { .. } => "cancel_group_session",
        Command::InsertRegistration { .. } => "insert_registration",
        Command::UpdateRegistrationStatus { .. } => "update_registration_status",
        Command::SelectProviders => "select_providers",
        Command::SelectServices { .. } => "select_services",
        Command::SelectAppointments { .. } => "select_appointments",
        Command::SelectBlockedRanges { .. } => "select_blocked_ranges",
        Command::SelectDayRules { .. } => "select_day_rules",
        Command::SelectGroupSessions { .. } => "select_group_sessions",
        Command::SelectRegistrations { .. } => "select_registrations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectWorkingHours { .. } => "select_working_hours",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
