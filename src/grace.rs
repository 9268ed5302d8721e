//! Grace period before trashed items become obsolete
//!
//! Unseen items are only trashed. Whether trashed items may be made
//! obsolete is decided at the end of a complete scan from three persisted
//! settings: when items were last removed, when the last sweep ran, and how
//! many complete scans happened since.

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::config::GracePolicy;
use crate::error::Result;
use crate::store::{
    ItemStore, SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT, SETTING_DELETE_REMOVED_TIME,
    SETTING_REMOVED_ITEMS_TIME, SETTING_SCANNED,
};

/// Whether trashed items may be made obsolete now
///
/// Never true within `min_days_between_sweeps` of the previous sweep.
pub fn should_delete_removed(
    policy: &GracePolicy,
    removed_items_time: Option<DateTime<Utc>>,
    delete_removed_time: Option<DateTime<Utc>>,
    complete_scans: i64,
    now: DateTime<Utc>,
) -> bool {
    let Some(removed_items_time) = removed_items_time else {
        return false;
    };

    if let Some(last_sweep) = delete_removed_time {
        if (now - last_sweep).num_days() <= policy.min_days_between_sweeps {
            return false;
        }
    }

    let days_past = (now - removed_items_time).num_days();

    (days_past > policy.short_wait_days && complete_scans > policy.short_wait_scans)
        || (days_past > policy.long_wait_days && complete_scans > policy.long_wait_scans)
        || complete_scans > policy.max_scans
}

fn date_setting<S: ItemStore + ?Sized>(store: &S, key: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = store.setting(key)? else {
        return Ok(None);
    };
    if value.is_empty() {
        return Ok(None);
    }
    match DateTime::parse_from_rfc3339(&value) {
        Ok(date) => Ok(Some(date.with_timezone(&Utc))),
        Err(err) => {
            warn!("Ignoring unparsable setting {}={:?}: {}", key, value, err);
            Ok(None)
        }
    }
}

fn complete_scan_count<S: ItemStore + ?Sized>(store: &S) -> Result<i64> {
    Ok(store
        .setting(SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT)?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}

/// Read the persisted state and apply [`should_delete_removed`]
pub fn check_delete_removed<S: ItemStore + ?Sized>(
    store: &S,
    policy: &GracePolicy,
    now: DateTime<Utc>,
) -> Result<bool> {
    let removed = date_setting(store, SETTING_REMOVED_ITEMS_TIME)?;
    let last_sweep = date_setting(store, SETTING_DELETE_REMOVED_TIME)?;
    let scans = complete_scan_count(store)?;
    let decision = should_delete_removed(policy, removed, last_sweep, scans, now);
    debug!(
        "Removed items at {:?}, last sweep {:?}, {} complete scans since: delete = {}",
        removed, last_sweep, scans, decision
    );
    Ok(decision)
}

pub fn update_removed_items_time<S: ItemStore + ?Sized>(store: &mut S, time: DateTime<Utc>) -> Result<()> {
    store.set_setting(SETTING_REMOVED_ITEMS_TIME, Some(&time.to_rfc3339()))
}

pub fn increment_complete_scan_count<S: ItemStore + ?Sized>(store: &mut S) -> Result<()> {
    let count = complete_scan_count(store)? + 1;
    store.set_setting(SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT, Some(&count.to_string()))
}

/// Record that a sweep ran at `now`
pub fn reset_delete_removed_settings<S: ItemStore + ?Sized>(store: &mut S, now: DateTime<Utc>) -> Result<()> {
    store.set_setting(SETTING_REMOVED_ITEMS_TIME, None)?;
    store.set_setting(SETTING_DELETE_REMOVED_TIME, Some(&now.to_rfc3339()))?;
    store.set_setting(SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT, Some("0"))
}

pub fn mark_database_as_scanned<S: ItemStore + ?Sized>(store: &mut S, now: DateTime<Utc>) -> Result<()> {
    store.set_setting(SETTING_SCANNED, Some(&now.to_rfc3339()))
}

pub fn database_initial_scan_done<S: ItemStore + ?Sized>(store: &S) -> Result<bool> {
    Ok(store
        .setting(SETTING_SCANNED)?
        .is_some_and(|value| !value.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn days_ago(days: i64) -> Option<DateTime<Utc>> {
        Some(now() - Duration::days(days))
    }

    #[test]
    fn test_nothing_removed_nothing_deleted() {
        let policy = GracePolicy::default();
        assert!(!should_delete_removed(&policy, None, None, 100, now()));
    }

    #[test]
    fn test_short_wait() {
        let policy = GracePolicy::default();
        assert!(should_delete_removed(&policy, days_ago(8), None, 3, now()));
        assert!(!should_delete_removed(&policy, days_ago(8), None, 2, now()));
        assert!(!should_delete_removed(&policy, days_ago(7), None, 3, now()));
    }

    #[test]
    fn test_long_wait() {
        let policy = GracePolicy::default();
        assert!(should_delete_removed(&policy, days_ago(31), None, 1, now()));
        assert!(!should_delete_removed(&policy, days_ago(31), None, 0, now()));
        assert!(!should_delete_removed(&policy, days_ago(30), None, 1, now()));
    }

    #[test]
    fn test_many_scans() {
        let policy = GracePolicy::default();
        assert!(should_delete_removed(&policy, days_ago(0), None, 31, now()));
        assert!(!should_delete_removed(&policy, days_ago(0), None, 30, now()));
    }

    #[test]
    fn test_recent_sweep_blocks() {
        let policy = GracePolicy::default();
        assert!(!should_delete_removed(&policy, days_ago(60), days_ago(7), 100, now()));
        assert!(should_delete_removed(&policy, days_ago(60), days_ago(8), 100, now()));
    }

    #[test]
    fn test_settings_bookkeeping() {
        let mut store = SqliteStore::open_memory().unwrap();
        let policy = GracePolicy::default();
        assert!(!check_delete_removed(&store, &policy, now()).unwrap());
        assert!(!database_initial_scan_done(&store).unwrap());

        update_removed_items_time(&mut store, now() - Duration::days(40)).unwrap();
        assert!(!check_delete_removed(&store, &policy, now()).unwrap());
        increment_complete_scan_count(&mut store).unwrap();
        assert!(check_delete_removed(&store, &policy, now()).unwrap());

        reset_delete_removed_settings(&mut store, now()).unwrap();
        assert_eq!(store.setting(SETTING_REMOVED_ITEMS_TIME).unwrap(), None);
        assert_eq!(
            store.setting(SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT).unwrap().as_deref(),
            Some("0")
        );
        assert!(!check_delete_removed(&store, &policy, now()).unwrap());

        mark_database_as_scanned(&mut store, now()).unwrap();
        assert!(database_initial_scan_done(&store).unwrap());
    }

    #[test]
    fn test_garbage_setting_is_ignored() {
        let mut store = SqliteStore::open_memory().unwrap();
        store
            .set_setting(SETTING_REMOVED_ITEMS_TIME, Some("last tuesday"))
            .unwrap();
        store
            .set_setting(SETTING_DELETE_REMOVED_COMPLETE_SCAN_COUNT, Some("99"))
            .unwrap();
        assert!(!check_delete_removed(&store, &GracePolicy::default(), now()).unwrap());
    }

    proptest! {
        #[test]
        fn prop_no_sweep_within_min_days(
            removed_days in 0i64..400,
            sweep_days in 0i64..=7,
            scans in 0i64..1000,
        ) {
            let policy = GracePolicy::default();
            prop_assert!(!should_delete_removed(
                &policy,
                days_ago(removed_days),
                days_ago(sweep_days),
                scans,
                now(),
            ));
        }

        #[test]
        fn prop_more_scans_never_blocks(
            removed_days in 0i64..400,
            scans in 0i64..100,
        ) {
            let policy = GracePolicy::default();
            if should_delete_removed(&policy, days_ago(removed_days), None, scans, now()) {
                prop_assert!(should_delete_removed(&policy, days_ago(removed_days), None, scans + 1, now()));
            }
        }
    }
}
