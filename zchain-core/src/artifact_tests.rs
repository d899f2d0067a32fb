/*!
Tests for artifact name parsing, formatting and ordering.
*/

#[cfg(test)]
mod tests {
    use crate::artifact::{ArtifactId, ArtifactKind};
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test]
    fn test_parse_full_artifact() {
        let id = ArtifactId::parse("zfs-simple-backup-restore-full-20250714013000.zfs.gz").unwrap();
        assert_eq!(id.prefix, "zfs-simple-backup-restore");
        assert_eq!(id.kind, ArtifactKind::Full);
        assert_eq!(id.timestamp, at(2025, 7, 14, 1, 30, 0));
    }

    #[test]
    fn test_parse_diff_artifact() {
        let id = ArtifactId::parse("nightly-diff-20250716230159.zfs.gz").unwrap();
        assert_eq!(id.prefix, "nightly");
        assert_eq!(id.kind, ArtifactKind::Diff);
        assert_eq!(id.timestamp, at(2025, 7, 16, 23, 1, 59));
    }

    #[test]
    fn test_last_marker_wins() {
        // A prefix that itself contains a kind marker
        let id = ArtifactId::parse("odd-full-name-diff-20250101000000.zfs.gz").unwrap();
        assert_eq!(id.prefix, "odd-full-name");
        assert_eq!(id.kind, ArtifactKind::Diff);
    }

    #[test]
    fn test_format_roundtrip_names() {
        let id = ArtifactId::new("MYBACKUP", ArtifactKind::Full, at(2025, 1, 2, 3, 4, 5));
        assert_eq!(id.snapshot_name(), "MYBACKUP-full-20250102030405");
        assert_eq!(id.file_name(), "MYBACKUP-full-20250102030405.zfs.gz");
        assert_eq!(id.tmp_file_name(), "MYBACKUP-full-20250102030405.zfs.gz.tmp");
        assert_eq!(ArtifactId::parse(&id.file_name()).unwrap(), id);
    }

    #[test]
    fn test_subsecond_precision_dropped() {
        let precise = at(2025, 1, 2, 3, 4, 5)
            .checked_add_signed(chrono::Duration::milliseconds(750))
            .unwrap();
        let id = ArtifactId::new("p", ArtifactKind::Diff, precise);
        assert_eq!(id.timestamp, at(2025, 1, 2, 3, 4, 5));
    }

    #[test]
    fn test_parse_rejects_malformed_names() {
        assert!(ArtifactId::parse("prefix-full-20250101000000.zfs").is_err());
        assert!(ArtifactId::parse("prefix-full-20250101000000.zfs.gz.tmp").is_err());
        assert!(ArtifactId::parse("prefix-incr-20250101000000.zfs.gz").is_err());
        assert!(ArtifactId::parse("prefix-full-2025010100.zfs.gz").is_err());
        assert!(ArtifactId::parse("prefix-full-20251301000000.zfs.gz").is_err());
        assert!(ArtifactId::parse("-full-20250101000000.zfs.gz").is_err());
        assert!(ArtifactId::parse("last_chain").is_err());
    }

    #[test]
    fn test_parse_snapshot_name() {
        let id = ArtifactId::parse_snapshot_name("p-full-20250101000000").unwrap();
        assert!(id.is_full());
        assert_eq!(id.file_name(), "p-full-20250101000000.zfs.gz");
    }

    #[test]
    fn test_ordering_full_first_then_timestamp() {
        let full = ArtifactId::new("p", ArtifactKind::Full, at(2025, 1, 5, 0, 0, 0));
        let early_diff = ArtifactId::new("p", ArtifactKind::Diff, at(2025, 1, 1, 0, 0, 0));
        let late_diff = ArtifactId::new("p", ArtifactKind::Diff, at(2025, 1, 9, 0, 0, 0));

        let mut ids = vec![late_diff.clone(), full.clone(), early_diff.clone()];
        ids.sort();
        assert_eq!(ids, vec![full, early_diff, late_diff]);
    }
}
