//! Property-based tests for the delivery ledger state machine.
//!
//! Applies arbitrary patch sequences to a pending record and checks that
//! `attempts` never decreases and a terminal status is never left, whatever
//! order the patches arrive in.

use chrono::{TimeZone, Utc};
use hookline_core::models::{DeliveryId, DeliveryPatch, DeliveryRecord, DeliveryStatus};
use proptest::prelude::*;

fn status_strategy() -> impl Strategy<Value = Option<DeliveryStatus>> {
    prop_oneof![
        3 => Just(None),
        1 => Just(Some(DeliveryStatus::Pending)),
        1 => Just(Some(DeliveryStatus::Delivered)),
        1 => Just(Some(DeliveryStatus::Failed)),
    ]
}

fn patch_strategy() -> impl Strategy<Value = DeliveryPatch> {
    (status_strategy(), prop::option::of(0i32..10), prop::option::of(100u16..600))
        .prop_map(|(status, attempts, code)| {
            let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut patch = DeliveryPatch { status, attempts, ..DeliveryPatch::default() };
            if attempts.is_some() {
                patch.last_attempt_at = Some(at);
            }
            if let Some(code) = code {
                patch = patch.with_response(code, "body");
            }
            patch
        })
}

proptest! {
    #[test]
    fn attempts_are_monotonic_and_terminal_states_stick(
        patches in prop::collection::vec(patch_strategy(), 1..20)
    ) {
        let mut record = DeliveryRecord::pending(
            DeliveryId::new(),
            "app-a",
            "order.created",
            "{}",
            Utc::now(),
        );
        let mut previous_attempts = record.attempts;
        let mut terminal: Option<DeliveryStatus> = None;

        for patch in &patches {
            let result = record.apply(patch);

            prop_assert!(record.attempts >= previous_attempts);
            previous_attempts = record.attempts;

            match terminal {
                Some(status) => {
                    prop_assert_eq!(record.status, status);
                    prop_assert_eq!(result.is_ok(), patch.status == Some(status));
                },
                None => {
                    prop_assert!(result.is_ok());
                    if record.status.is_terminal() {
                        terminal = Some(record.status);
                    }
                },
            }
        }
    }

    #[test]
    fn rejected_patches_leave_record_unchanged(attempts in 0i32..10) {
        let mut record = DeliveryRecord::pending(
            DeliveryId::new(),
            "app-a",
            "order.created",
            "{}",
            Utc::now(),
        );
        record.apply(&DeliveryPatch::attempt(1, Utc::now()).with_response(200, "ok").delivered()).unwrap();
        let snapshot = record.clone();

        let patch = DeliveryPatch { attempts: Some(attempts), ..DeliveryPatch::default() }.failed();
        prop_assert!(record.apply(&patch).is_err());
        prop_assert_eq!(record, snapshot);
    }
}
