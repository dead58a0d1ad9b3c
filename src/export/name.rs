// export/name.rs
//
// Export naming recipe and the 63-byte cap.

use crate::models::BackupType;
use chrono::{DateTime, Utc};

/// NBD export names longer than this are refused by common clients.
pub const MAX_EXPORT_NAME: usize = 63;

/// Composes a backup export name:
/// `backup-{contextId}-disk{diskOrdinal}-{type}-{timestamp}`.
///
/// When the composed name would exceed 63 bytes the context id segment is
/// truncated from its right until the whole name fits; the other segments
/// are never shortened.
pub fn backup_export_name(
    context_id: &str,
    disk_ordinal: i32,
    backup_type: BackupType,
    at: DateTime<Utc>,
) -> String {
    let timestamp = at.format("%Y%m%dT%H%M%S").to_string();
    let fixed_len = "backup-".len()
        + format!("-disk{}", disk_ordinal).len()
        + 1
        + backup_type.export_tag().len()
        + 1
        + timestamp.len();

    let budget = MAX_EXPORT_NAME.saturating_sub(fixed_len);
    let context = truncate_bytes(context_id, budget);

    format!(
        "backup-{}-disk{}-{}-{}",
        context,
        disk_ordinal,
        backup_type.export_tag(),
        timestamp
    )
}

/// Composes a migration export name in the disjoint `migration-` namespace.
pub fn migration_export_name(context_id: &str, disk_ordinal: i32, at: DateTime<Utc>) -> String {
    let timestamp = at.format("%Y%m%dT%H%M%S").to_string();
    let fixed_len =
        "migration-".len() + format!("-disk{}", disk_ordinal).len() + 1 + timestamp.len();

    let budget = MAX_EXPORT_NAME.saturating_sub(fixed_len);
    let context = truncate_bytes(context_id, budget);

    format!("migration-{}-disk{}-{}", context, disk_ordinal, timestamp)
}

/// Truncates a string to at most `max` bytes on a char boundary, keeping
/// the prefix.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 30, 45).unwrap()
    }

    #[test]
    fn short_names_pass_through() {
        let name = backup_export_name("vm-42", 0, BackupType::Full, at());
        assert_eq!(name, "backup-vm-42-disk0-full-20260801T123045");
        assert!(name.len() <= MAX_EXPORT_NAME);
    }

    #[test]
    fn exactly_63_bytes_is_accepted_untruncated() {
        // fixed part without context: "backup--disk0-full-20260801T123045" = 34 bytes,
        // so a 29-byte context lands exactly on 63.
        let context = "c".repeat(29);
        let name = backup_export_name(&context, 0, BackupType::Full, at());
        assert_eq!(name.len(), MAX_EXPORT_NAME);
        assert!(name.contains(&context));
    }

    #[test]
    fn sixty_four_bytes_truncates_context_only() {
        let context = "c".repeat(30);
        let name = backup_export_name(&context, 0, BackupType::Full, at());
        assert_eq!(name.len(), MAX_EXPORT_NAME);
        // Context lost exactly one byte from its right.
        assert!(name.starts_with(&format!("backup-{}", "c".repeat(29))));
        // The trailing recipe is intact.
        assert!(name.ends_with("-disk0-full-20260801T123045"));
    }

    #[test]
    fn long_context_keeps_prefix() {
        let context = format!("{}-{}", "a".repeat(40), "b".repeat(40));
        let name = backup_export_name(&context, 3, BackupType::Incremental, at());
        assert!(name.len() <= MAX_EXPORT_NAME);
        assert!(name.starts_with("backup-aaaaaaaa"));
        assert!(name.ends_with("-disk3-incr-20260801T123045"));
    }

    #[test]
    fn migration_namespace_is_disjoint() {
        let backup = backup_export_name("vm-1", 0, BackupType::Full, at());
        let migration = migration_export_name("vm-1", 0, at());
        assert!(backup.starts_with("backup-"));
        assert!(migration.starts_with("migration-"));
        assert!(migration.len() <= MAX_EXPORT_NAME);
    }
}
