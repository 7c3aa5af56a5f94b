use crate::model::Ms;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
/// A single segment may not span more than ~13 months.
pub const MAX_SPAN_DURATION_MS: Ms = 400 * 24 * 3_600_000;
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 366 * 24 * 3_600_000;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_HIERARCHY_DEPTH: usize = 8;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ID_LEN: usize = 128;
pub const MAX_TENANT_LEN: usize = 128;
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024;
pub const MAX_SEGMENTS_PER_RESERVATION: usize = 64;
pub const MAX_UNRESOLVED_QUEUE: usize = 500;

pub const MAX_COST_COMPONENTS: usize = 128;
/// R10,000,000.00 in cents; anything larger is a typo, not a booking.
pub const MAX_COMPONENT_AMOUNT_CENTS: i64 = 1_000_000_000;
pub const MAX_TAX_RATE_BPS: u32 = 10_000;
pub const MAX_AGENT_CONFIG_LEN: usize = 16 * 1024;

pub const MAX_AUDIT_METADATA_ENTRIES: usize = 64;
pub const MAX_AUDIT_METADATA_KEY_LEN: usize = 64;
pub const MAX_AUDIT_METADATA_VALUE_LEN: usize = 4 * 1024;
pub const MAX_AUDIT_ERROR_LEN: usize = 4 * 1024;
pub const MAX_AUDIT_QUERY_ROWS: usize = 10_000;

pub const MAX_LINE_LEN: usize = 256 * 1024;
