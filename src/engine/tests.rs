use super::*;
use crate::audit::{AuditOperation, AuditTarget};
use crate::cost::{CostComponent, ProposalStatus};
use crate::model::*;

const H: Ms = 3_600_000; // 1 hour in ms
/// 2026-01-05T00:00:00Z
const DAY: Ms = 1_767_571_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotgate_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new()), 1500).unwrap()
}

struct Cast {
    admin: Principal,
    scheduler: Principal,
    staff: Principal,
    other_staff: Principal,
}

async fn register_cast(engine: &Engine) -> Cast {
    let system = Principal::system();
    let cast = Cast {
        admin: Principal::human("ada", Role::Admin),
        scheduler: Principal::human("sam", Role::Scheduler),
        staff: Principal::human("sue", Role::Staff),
        other_staff: Principal::human("olu", Role::Staff),
    };
    for p in [&cast.admin, &cast.scheduler, &cast.staff, &cast.other_staff] {
        engine.register_principal(p.clone(), &system).await.unwrap();
    }
    cast
}

async fn room(engine: &Engine, name: &str, seats: u32, parent: Option<Ulid>) -> Ulid {
    let id = Ulid::new();
    engine
        .create_resource(
            id,
            name.to_string(),
            ResourceCategory::Room { seats },
            parent,
            &Principal::system(),
        )
        .await
        .unwrap();
    id
}

fn single(resource_id: Option<Ulid>, start: Ms, end: Ms) -> SubmitRequest {
    SubmitRequest {
        segments: vec![SegmentRequest {
            id: None,
            resource_id,
            start,
            end,
        }],
        group_id: None,
        tenant: "acme".into(),
        headcount: 4,
        payload: None,
        override_conflicts: false,
    }
}

fn overriding(mut req: SubmitRequest) -> SubmitRequest {
    req.override_conflicts = true;
    req
}

fn transition(id: Ulid, target: ReservationStatus) -> TransitionRequest {
    TransitionRequest {
        reservation_id: id,
        target,
        resource_id: None,
        override_conflicts: false,
        reason: None,
    }
}

async fn register_agent(engine: &Engine, id: &str, config: AgentConfig) -> Principal {
    engine
        .register_agent(
            AgentRegistration {
                agent_id: id.to_string(),
                version: "1.0.0".into(),
                tier: Tier::Agent,
                enabled: true,
                config,
            },
            &Principal::system(),
        )
        .await
        .unwrap();
    Principal::agent(id)
}

// ── Conflict resolver ────────────────────────────────────

#[tokio::test]
async fn adjacent_windows_do_not_conflict() {
    let engine = new_engine("adjacent.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let first = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 17 * H), &cast.scheduler)
        .await
        .unwrap();
    let first_id = first.segments[0].id;
    assert_eq!(first.segments[0].status, ReservationStatus::ResourceAssigned);
    engine
        .transition_reservation(transition(first_id, ReservationStatus::Confirmed), &cast.scheduler)
        .await
        .unwrap();

    let err = engine
        .submit_reservation(single(Some(r), DAY + 16 * H, DAY + 18 * H), &cast.scheduler)
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].reservation_id, first_id);
            assert_eq!(conflicts[0].relation, ConflictRelation::SameResource);
            assert_eq!(conflicts[0].status, ReservationStatus::Confirmed);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let ok = engine
        .submit_reservation(single(Some(r), DAY + 17 * H, DAY + 18 * H), &cast.scheduler)
        .await
        .unwrap();
    assert_eq!(ok.segments.len(), 1);
}

#[tokio::test]
async fn validate_reports_without_writing() {
    let engine = new_engine("validate.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();
    let audit_before = engine.audit_len();

    let verdict = engine.validate(Some(r), DAY + 11 * H, DAY + 13 * H, None).await.unwrap();
    assert!(!verdict.is_clear());
    let verdict = engine.validate(Some(r), DAY + 12 * H, DAY + 13 * H, None).await.unwrap();
    assert!(verdict.is_clear());
    // Ghost inventory holds nothing, so there is nothing to collide with.
    let verdict = engine.validate(None, DAY + 9 * H, DAY + 12 * H, None).await.unwrap();
    assert!(verdict.is_clear());

    assert_eq!(engine.audit_len(), audit_before);
}

#[tokio::test]
async fn validate_excludes_the_reservation_being_moved() {
    let engine = new_engine("validate_exclude.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let out = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();
    let id = out.segments[0].id;

    let verdict = engine
        .validate(Some(r), DAY + 10 * H, DAY + 11 * H, Some(id))
        .await
        .unwrap();
    assert!(verdict.is_clear());
}

#[tokio::test]
async fn rejects_empty_and_inverted_windows() {
    let engine = new_engine("bad_window.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let err = engine
        .submit_reservation(single(Some(r), DAY + 10 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine
        .submit_reservation(single(Some(r), DAY + 11 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine.validate(Some(r), DAY + 11 * H, DAY + 10 * H, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_for_same_slot_admit_exactly_one() {
    let engine = Arc::new(new_engine("race.wal"));
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let actor = cast.scheduler.clone();
        handles.push(tokio::spawn(async move {
            engine
                .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &actor)
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 7);

    let rs = engine.get_resource(&r).unwrap();
    assert_eq!(rs.read().await.intervals.len(), 1);
}

#[tokio::test]
async fn multi_segment_submit_is_all_or_nothing() {
    let engine = new_engine("all_or_nothing.wal");
    let cast = register_cast(&engine).await;
    let a = room(&engine, "Room A", 10, None).await;
    let b = room(&engine, "Room B", 10, None).await;
    engine
        .submit_reservation(single(Some(b), DAY + 14 * H, DAY + 15 * H), &cast.scheduler)
        .await
        .unwrap();

    let first = Ulid::new();
    let req = SubmitRequest {
        segments: vec![
            SegmentRequest {
                id: Some(first),
                resource_id: Some(a),
                start: DAY + 9 * H,
                end: DAY + 10 * H,
            },
            SegmentRequest {
                id: None,
                resource_id: Some(b),
                start: DAY + 14 * H,
                end: DAY + 16 * H,
            },
        ],
        ..single(None, DAY, DAY + H)
    };
    let err = engine.submit_reservation(req, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert!(engine.get_reservation(&first).is_none());
    let rs = engine.get_resource(&a).unwrap();
    assert!(rs.read().await.intervals.is_empty());
}

#[tokio::test]
async fn multi_segment_group_shares_group_id() {
    let engine = new_engine("group.wal");
    let cast = register_cast(&engine).await;
    let a = room(&engine, "Room A", 10, None).await;

    let req = SubmitRequest {
        segments: vec![
            SegmentRequest {
                id: None,
                resource_id: Some(a),
                start: DAY + 9 * H,
                end: DAY + 10 * H,
            },
            SegmentRequest {
                id: None,
                resource_id: Some(a),
                start: DAY + 24 * H + 9 * H,
                end: DAY + 24 * H + 10 * H,
            },
        ],
        ..single(None, DAY, DAY + H)
    };
    let out = engine.submit_reservation(req, &cast.scheduler).await.unwrap();
    assert_eq!(out.segments.len(), 2);
    assert_eq!(out.group_id, out.segments[0].id);
    let group = engine.list_reservations(&ReservationFilter {
        group_id: Some(out.group_id),
        ..Default::default()
    });
    assert_eq!(group.len(), 2);
}

#[tokio::test]
async fn overlapping_segments_on_one_resource_rejected() {
    let engine = new_engine("self_overlap.wal");
    let cast = register_cast(&engine).await;
    let a = room(&engine, "Room A", 10, None).await;

    let req = SubmitRequest {
        segments: vec![
            SegmentRequest {
                id: None,
                resource_id: Some(a),
                start: DAY + 9 * H,
                end: DAY + 11 * H,
            },
            SegmentRequest {
                id: None,
                resource_id: Some(a),
                start: DAY + 10 * H,
                end: DAY + 12 * H,
            },
        ],
        ..single(None, DAY, DAY + H)
    };
    let err = engine.submit_reservation(req, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn inactive_resource_refuses_new_bookings_but_keeps_old_ones() {
    let engine = new_engine("inactive.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let out = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();

    let info = engine.set_resource_active(r, false, &cast.admin).await.unwrap();
    assert!(!info.active);
    let err = engine
        .submit_reservation(single(Some(r), DAY + 12 * H, DAY + 13 * H), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let existing = engine.get_reservation(&out.segments[0].id).unwrap();
    assert_eq!(existing.status, ReservationStatus::ResourceAssigned);

    let err = engine.set_resource_active(r, true, &cast.staff).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

#[tokio::test]
async fn capacity_shortfall_is_a_warning() {
    let engine = new_engine("capacity_warning.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Huddle", 4, None).await;

    let mut req = single(Some(r), DAY + 9 * H, DAY + 10 * H);
    req.headcount = 10;
    let out = engine.submit_reservation(req, &cast.scheduler).await.unwrap();
    assert_eq!(out.warnings.len(), 1);
    assert!(out.warnings[0].contains("Huddle"));

    let record = engine
        .audit_by_target(&AuditTarget::Reservation(out.group_id))
        .pop()
        .unwrap();
    assert!(record.metadata.contains_key("warnings"));
}

#[tokio::test]
async fn suggestions_skip_busy_and_related_rooms() {
    let engine = new_engine("suggest.wal");
    let cast = register_cast(&engine).await;
    let hall = room(&engine, "Hall", 100, None).await;
    let hall_a = room(&engine, "Hall A", 50, Some(hall)).await;
    let hall_b = room(&engine, "Hall B", 50, Some(hall)).await;
    let small = room(&engine, "Annex", 6, None).await;
    let lab = Ulid::new();
    engine
        .create_resource(
            lab,
            "Projector".into(),
            ResourceCategory::Device {
                device_type: "projector".into(),
            },
            None,
            &cast.admin,
        )
        .await
        .unwrap();

    engine
        .submit_reservation(single(Some(hall_a), DAY + 9 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();

    let free = engine
        .suggest_alternatives(DAY + 10 * H, DAY + 11 * H, Some("room"), None, None)
        .await
        .unwrap();
    let ids: Vec<Ulid> = free.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![small, hall_b]);

    let roomy = engine
        .suggest_alternatives(DAY + 10 * H, DAY + 11 * H, Some("room"), Some(20), None)
        .await
        .unwrap();
    assert_eq!(roomy.iter().map(|i| i.id).collect::<Vec<_>>(), vec![hall_b]);

    let devices = engine
        .suggest_alternatives(DAY + 10 * H, DAY + 11 * H, Some("device"), None, None)
        .await
        .unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id, lab);
}

// ── Related resources and the override policy ────────────

#[tokio::test]
async fn related_resource_conflict_yields_to_privileged_override() {
    let engine = new_engine("override.wal");
    let cast = register_cast(&engine).await;
    let hall = room(&engine, "Hall", 100, None).await;
    let hall_a = room(&engine, "Hall A", 50, Some(hall)).await;
    engine
        .submit_reservation(single(Some(hall_a), DAY + 9 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();

    let err = engine
        .submit_reservation(single(Some(hall), DAY + 10 * H, DAY + 11 * H), &cast.scheduler)
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(conflicts) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].relation, ConflictRelation::RelatedResource);
            assert_eq!(conflicts[0].resource_id, hall_a);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let out = engine
        .submit_reservation(
            overriding(single(Some(hall), DAY + 10 * H, DAY + 11 * H)),
            &cast.scheduler,
        )
        .await
        .unwrap();
    assert!(out.override_used);

    let record = engine
        .audit_by_target(&AuditTarget::Reservation(out.group_id))
        .pop()
        .unwrap();
    assert_eq!(record.metadata.get("override").map(String::as_str), Some("related_resource"));
    assert_eq!(record.authorized_by.as_deref(), Some("sam"));
}

#[tokio::test]
async fn unprivileged_override_is_unauthorized() {
    let engine = new_engine("override_staff.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let audit_before = engine.audit_len();

    let err = engine
        .submit_reservation(overriding(single(Some(r), DAY + 9 * H, DAY + 10 * H)), &cast.staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert_eq!(engine.audit_len(), audit_before);
}

#[tokio::test]
async fn same_resource_conflict_cannot_be_overridden() {
    let engine = new_engine("override_hard.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();

    let err = engine
        .submit_reservation(overriding(single(Some(r), DAY + 10 * H, DAY + 11 * H)), &cast.admin)
        .await
        .unwrap_err();
    match err {
        EngineError::Conflict(conflicts) => {
            assert!(conflicts.iter().any(|c| c.relation == ConflictRelation::SameResource));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn related_resources_walk_both_directions() {
    let engine = new_engine("related.wal");
    let campus = room(&engine, "Campus", 500, None).await;
    let hall = room(&engine, "Hall", 100, Some(campus)).await;
    let hall_a = room(&engine, "Hall A", 50, Some(hall)).await;
    let other = room(&engine, "Other", 10, None).await;

    let mut related = engine.related_resources(hall);
    related.sort();
    let mut expected = vec![campus, hall_a];
    expected.sort();
    assert_eq!(related, expected);
    assert!(engine.related_resources(other).is_empty());
}

// ── Ghost inventory lifecycle ────────────────────────────

#[tokio::test]
async fn unresolved_to_assigned_to_confirmed() {
    let engine = new_engine("ghost.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let out = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.staff)
        .await
        .unwrap();
    let id = out.segments[0].id;
    let pending = engine.get_reservation(&id).unwrap();
    assert_eq!(pending.status, ReservationStatus::Unresolved);
    assert_eq!(pending.resource_id, None);
    assert_eq!(pending.requested_resource, Some(r));
    assert_eq!(engine.unresolved_queue(10).len(), 1);

    let err = engine
        .transition_reservation(transition(id, ReservationStatus::Confirmed), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));

    let err = engine
        .transition_reservation(transition(id, ReservationStatus::ResourceAssigned), &cast.staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let assigned = engine
        .transition_reservation(transition(id, ReservationStatus::ResourceAssigned), &cast.scheduler)
        .await
        .unwrap();
    assert_eq!(assigned.reservation.status, ReservationStatus::ResourceAssigned);
    assert_eq!(assigned.reservation.resource_id, Some(r));
    assert!(engine.unresolved_queue(10).is_empty());

    let confirmed = engine
        .transition_reservation(transition(id, ReservationStatus::Confirmed), &cast.scheduler)
        .await
        .unwrap();
    assert_eq!(confirmed.reservation.status, ReservationStatus::Confirmed);

    let ops: Vec<AuditOperation> = engine
        .audit_by_target(&AuditTarget::Reservation(id))
        .into_iter()
        .map(|r| r.operation)
        .collect();
    assert_eq!(
        ops,
        vec![
            AuditOperation::ReservationSubmit,
            AuditOperation::ReservationAssign,
            AuditOperation::ReservationConfirm,
        ]
    );
}

#[tokio::test]
async fn unresolved_reservations_hold_no_slot() {
    let engine = new_engine("ghost_no_slot.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 10 * H), &cast.staff)
        .await
        .unwrap();
    engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 10 * H), &cast.other_staff)
        .await
        .unwrap();
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();
    assert_eq!(engine.unresolved_queue(10).len(), 2);
}

#[tokio::test]
async fn assignment_rechecks_conflicts() {
    let engine = new_engine("ghost_assign_conflict.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let spare = room(&engine, "Spare", 10, None).await;

    let out = engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 10 * H), &cast.staff)
        .await
        .unwrap();
    let id = out.segments[0].id;
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();

    let mut req = transition(id, ReservationStatus::ResourceAssigned);
    req.resource_id = Some(r);
    let err = engine.transition_reservation(req, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(engine.get_reservation(&id).unwrap().status, ReservationStatus::Unresolved);

    let mut req = transition(id, ReservationStatus::ResourceAssigned);
    req.resource_id = Some(spare);
    let out = engine.transition_reservation(req, &cast.scheduler).await.unwrap();
    assert_eq!(out.reservation.resource_id, Some(spare));

    // Without a requested resource there is nothing to default to.
    let out = engine
        .submit_reservation(single(None, DAY + 11 * H, DAY + 12 * H), &cast.staff)
        .await
        .unwrap();
    let err = engine
        .transition_reservation(
            transition(out.segments[0].id, ReservationStatus::ResourceAssigned),
            &cast.scheduler,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn cancel_rules() {
    let engine = new_engine("cancel.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let mine = engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 10 * H), &cast.staff)
        .await
        .unwrap()
        .segments[0]
        .id;
    let err = engine
        .transition_reservation(transition(mine, ReservationStatus::Cancelled), &cast.other_staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    // Scheduling rights are not enough to cancel someone else's booking.
    let err = engine
        .transition_reservation(transition(mine, ReservationStatus::Cancelled), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let out = engine
        .transition_reservation(transition(mine, ReservationStatus::Cancelled), &cast.staff)
        .await
        .unwrap();
    assert_eq!(out.reservation.status, ReservationStatus::Cancelled);

    let err = engine
        .transition_reservation(transition(mine, ReservationStatus::Cancelled), &cast.staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));

    // Cancelling a bound reservation frees its slot.
    let bound = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap()
        .segments[0]
        .id;
    let mut req = transition(bound, ReservationStatus::Cancelled);
    req.reason = Some("client moved the meeting".into());
    engine.transition_reservation(req, &cast.admin).await.unwrap();
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();

    let cancel_record = engine
        .audit_by_target(&AuditTarget::Reservation(bound))
        .pop()
        .unwrap();
    assert_eq!(cancel_record.operation, AuditOperation::ReservationCancel);
    assert_eq!(
        cancel_record.metadata.get("reason").map(String::as_str),
        Some("client moved the meeting")
    );
    assert_eq!(cancel_record.authorized_by.as_deref(), Some("ada"));
}

#[tokio::test]
async fn missing_reservation_is_not_found() {
    let engine = new_engine("transition_missing.wal");
    let cast = register_cast(&engine).await;
    let err = engine
        .transition_reservation(transition(Ulid::new(), ReservationStatus::Confirmed), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Audit log ────────────────────────────────────────────

#[tokio::test]
async fn every_successful_mutation_appends_one_record() {
    let engine = new_engine("audit_counts.wal");
    let cast = register_cast(&engine).await;
    let start = engine.audit_len();

    let r = room(&engine, "Boardroom", 10, None).await;
    assert_eq!(engine.audit_len(), start + 1);

    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();
    assert_eq!(engine.audit_len(), start + 2);

    let _ = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap_err();
    assert_eq!(engine.audit_len(), start + 2);

    let _ = engine
        .create_resource(Ulid::new(), "Nope".into(), ResourceCategory::Room { seats: 2 }, None, &cast.staff)
        .await
        .unwrap_err();
    assert_eq!(engine.audit_len(), start + 2);

    let by_sam = engine.audit_by_actor("sam");
    assert_eq!(by_sam.len(), 1);
    assert_eq!(by_sam[0].actor_kind, ActorKind::Human);
}

#[tokio::test]
async fn oversized_audit_record_aborts_the_mutation() {
    let engine = new_engine("audit_failure.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let id = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap()
        .segments[0]
        .id;
    let audit_before = engine.audit_len();

    let mut req = transition(id, ReservationStatus::Cancelled);
    req.reason = Some("x".repeat(crate::limits::MAX_AUDIT_METADATA_VALUE_LEN + 1));
    let err = engine.transition_reservation(req, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::AuditWriteFailure(_)));

    assert_eq!(engine.audit_len(), audit_before);
    assert_eq!(
        engine.get_reservation(&id).unwrap().status,
        ReservationStatus::ResourceAssigned
    );
    let rs = engine.get_resource(&r).unwrap();
    assert_eq!(rs.read().await.intervals.len(), 1);
}

#[tokio::test]
async fn agents_log_their_own_actions() {
    let engine = new_engine("log_action.wal");
    let cast = register_cast(&engine).await;
    let bot = register_agent(
        &engine,
        "inventory-bot",
        AgentConfig::Auditor {
            schedule: Some("0 2 * * *".into()),
            max_discrepancy_pct: 5,
        },
    )
    .await;

    let mut meta = BTreeMap::new();
    meta.insert("checked".to_string(), "42".to_string());
    let id = engine
        .log_action(
            &bot,
            AuditOperation::InventoryAudit,
            AuditTarget::External("warehouse:7".into()),
            meta,
            false,
            Some("two projectors missing".into()),
            Some(1200),
        )
        .await
        .unwrap();
    let record = engine.audit_record(&id).unwrap();
    assert_eq!(record.actor_kind, ActorKind::Agent);
    assert!(!record.success);
    assert_eq!(record.duration_ms, Some(1200));
    assert_eq!(record.error.as_deref(), Some("two projectors missing"));

    let err = engine
        .log_action(
            &cast.staff,
            AuditOperation::Read,
            AuditTarget::None,
            BTreeMap::new(),
            true,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
}

// ── Agents and the approval gate ─────────────────────────

#[tokio::test]
async fn disabled_agent_is_refused() {
    let engine = new_engine("agent_disabled.wal");
    let cast = register_cast(&engine).await;
    let bot = register_agent(
        &engine,
        "resolver",
        AgentConfig::ConflictResolver { lookahead_days: 7 },
    )
    .await;
    assert!(engine.begin_unit_of_work("resolver").is_ok());

    let quota = engine.set_agent_enabled("resolver", false, &cast.admin).await.unwrap();
    assert!(!quota.enabled);
    let err = engine.begin_unit_of_work("resolver").unwrap_err();
    assert!(matches!(err, EngineError::AgentDisabled(_)));

    let err = engine
        .log_action(&bot, AuditOperation::Read, AuditTarget::None, BTreeMap::new(), true, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AgentDisabled(_)));

    let err = engine.set_agent_enabled("resolver", true, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    assert!(matches!(
        engine.begin_unit_of_work("nobody"),
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn agent_reregistration_records_previous_version() {
    let engine = new_engine("agent_reregister.wal");
    let cast = register_cast(&engine).await;
    register_agent(&engine, "bot", AgentConfig::ConflictResolver { lookahead_days: 3 }).await;

    let quota = engine
        .register_agent(
            AgentRegistration {
                agent_id: "bot".into(),
                version: "1.1.0".into(),
                tier: Tier::System,
                enabled: true,
                config: AgentConfig::ConflictResolver { lookahead_days: 14 },
            },
            &cast.admin,
        )
        .await
        .unwrap();
    assert_eq!(quota.version, "1.1.0");
    assert_eq!(quota.updated_by, "ada");

    let last = engine
        .audit_by_target(&AuditTarget::Agent("bot".into()))
        .pop()
        .unwrap();
    assert_eq!(last.operation, AuditOperation::AgentConfigChange);
    assert_eq!(last.metadata.get("previous_version").map(String::as_str), Some("1.0.0"));

    let err = engine
        .register_agent(
            AgentRegistration {
                agent_id: "sue".into(),
                version: "1".into(),
                tier: Tier::Agent,
                enabled: true,
                config: AgentConfig::ConflictResolver { lookahead_days: 1 },
            },
            &cast.admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
}

#[tokio::test]
async fn proposals_need_a_human_and_invoicing_needs_an_admin() {
    let engine = new_engine("approval.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let reservation = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap()
        .segments[0]
        .id;
    let bot = register_agent(
        &engine,
        "revenue-bot",
        AgentConfig::Revenue {
            schedule: None,
            tax_rate_bps: Some(1500),
        },
    )
    .await;

    let components = vec![
        CostComponent::Room {
            resource_id: Some(r),
            description: "Boardroom, 1h".into(),
            amount_cents: 100_000,
        },
        CostComponent::Catering {
            description: "Lunch".into(),
            headcount: 10,
            per_head_cents: 2_500,
        },
    ];
    let err = engine
        .propose_cost(None, reservation, components.clone(), &cast.staff)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let id = engine
        .propose_cost(None, reservation, components, &bot)
        .await
        .unwrap();
    let proposal = engine.get_proposal(&id).unwrap();
    assert_eq!(proposal.status, ProposalStatus::PendingReview);
    assert_eq!(proposal.subtotal_cents(), 125_000);
    assert_eq!(proposal.tax_cents(), 18_750);
    assert_eq!(proposal.total_cents(), 143_750);
    assert_eq!(engine.list_pending_proposals(None).len(), 1);
    assert_eq!(engine.list_pending_proposals(Some(Tier::Agent)).len(), 1);
    assert!(engine.list_pending_proposals(Some(Tier::System)).is_empty());

    let audit_before = engine.audit_len();
    let err = engine.review_proposal(id, true, &bot, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = engine.invoice_proposal(id, &cast.admin).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
    assert_eq!(engine.audit_len(), audit_before);

    let approved = engine
        .review_proposal(id, true, &cast.staff, Some("looks right".into()))
        .await
        .unwrap();
    assert_eq!(approved.status, ProposalStatus::Approved);
    assert_eq!(approved.reviewed_by.as_deref(), Some("sue"));
    assert!(engine.list_pending_proposals(None).is_empty());

    let err = engine.invoice_proposal(id, &bot).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = engine.invoice_proposal(id, &cast.scheduler).await.unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));

    let invoiced = engine.invoice_proposal(id, &cast.admin).await.unwrap();
    assert_eq!(invoiced.status, ProposalStatus::Invoiced);
    assert_eq!(invoiced.invoiced_by.as_deref(), Some("ada"));

    let err = engine.invoice_proposal(id, &cast.admin).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));

    let ops: Vec<AuditOperation> = engine
        .audit_by_target(&AuditTarget::Proposal(id))
        .into_iter()
        .map(|r| r.operation)
        .collect();
    assert_eq!(
        ops,
        vec![
            AuditOperation::CostPropose,
            AuditOperation::ProposalApprove,
            AuditOperation::ProposalInvoice,
        ]
    );
}

#[tokio::test]
async fn rejected_proposal_is_terminal() {
    let engine = new_engine("approval_reject.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let reservation = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap()
        .segments[0]
        .id;
    let bot = register_agent(
        &engine,
        "revenue-bot",
        AgentConfig::Revenue {
            schedule: None,
            tax_rate_bps: None,
        },
    )
    .await;
    let id = engine
        .propose_cost(
            None,
            reservation,
            vec![CostComponent::Supplies {
                description: "Markers".into(),
                amount_cents: 1_000,
            }],
            &bot,
        )
        .await
        .unwrap();
    // Falls back to the engine-wide rate.
    assert_eq!(engine.get_proposal(&id).unwrap().tax_rate_bps, 1500);

    let rejected = engine.review_proposal(id, false, &cast.scheduler, None).await.unwrap();
    assert_eq!(rejected.status, ProposalStatus::Rejected);
    let err = engine.review_proposal(id, true, &cast.admin, None).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
    let err = engine.invoice_proposal(id, &cast.admin).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition { .. }));
}

#[tokio::test]
async fn proposals_for_cancelled_reservations_are_refused() {
    let engine = new_engine("approval_cancelled.wal");
    let cast = register_cast(&engine).await;
    let reservation = engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 10 * H), &cast.staff)
        .await
        .unwrap()
        .segments[0]
        .id;
    engine
        .transition_reservation(transition(reservation, ReservationStatus::Cancelled), &cast.staff)
        .await
        .unwrap();
    let bot = register_agent(
        &engine,
        "revenue-bot",
        AgentConfig::Revenue {
            schedule: None,
            tax_rate_bps: None,
        },
    )
    .await;

    let err = engine
        .propose_cost(
            None,
            reservation,
            vec![CostComponent::Supplies {
                description: "Markers".into(),
                amount_cents: 1_000,
            }],
            &bot,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine
        .propose_cost(None, Ulid::new(), Vec::new(), &bot)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Principals ───────────────────────────────────────────

#[tokio::test]
async fn principal_registration_rules() {
    let engine = new_engine("principals.wal");
    let cast = register_cast(&engine).await;

    assert_eq!(engine.principal("sam"), Some(cast.scheduler.clone()));
    assert!(engine.principal("nobody").is_none());

    let err = engine
        .register_principal(Principal::human("zed", Role::Staff), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized(_)));
    let err = engine
        .register_principal(Principal::human("sue", Role::Admin), &cast.admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = engine
        .register_principal(Principal::agent("bot"), &cast.admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let no_role = Principal {
        id: "norole".into(),
        kind: ActorKind::Human,
        role: None,
    };
    let err = engine.register_principal(no_role, &cast.admin).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn resource_creation_rules() {
    let engine = new_engine("resources.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;

    let err = engine
        .create_resource(r, "Again".into(), ResourceCategory::Room { seats: 2 }, None, &cast.admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));
    let err = engine
        .create_resource(
            Ulid::new(),
            "Orphan".into(),
            ResourceCategory::Room { seats: 2 },
            Some(Ulid::new()),
            &cast.admin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    let err = engine
        .create_resource(Ulid::new(), "  ".into(), ResourceCategory::Room { seats: 2 }, None, &cast.admin)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let names: Vec<String> = engine.list_resources().into_iter().map(|i| i.name).collect();
    assert_eq!(names, vec!["Boardroom".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_of_one_resource_admit_exactly_one() {
    let engine = Arc::new(new_engine("create_race.wal"));
    let hall = room(&engine, "Hall", 100, None).await;

    for round in 0..20 {
        let id = Ulid::new();
        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .create_resource(
                        id,
                        format!("Hall part {round}.{i}"),
                        ResourceCategory::Room { seats: 20 },
                        Some(hall),
                        &Principal::system(),
                    )
                    .await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(ok, 1, "round {round}");
        assert_eq!(engine.audit_by_target(&AuditTarget::Resource(id)).len(), 1);
    }
    assert_eq!(engine.children.get(&hall).unwrap().len(), 20);
}

#[tokio::test]
async fn repeated_resource_creation_event_keeps_bindings() {
    let engine = new_engine("create_twice.wal");
    let cast = register_cast(&engine).await;
    let hall = room(&engine, "Hall", 100, None).await;
    let r = room(&engine, "Hall A", 50, Some(hall)).await;
    engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();

    let again = Event::ResourceCreated {
        id: r,
        name: "Hall A".into(),
        category: ResourceCategory::Room { seats: 50 },
        parent_id: Some(hall),
    };
    engine.apply_event(&again, &mut Guards::new());

    let rs = engine.get_resource(&r).unwrap();
    assert_eq!(rs.read().await.intervals.len(), 1);
    assert_eq!(engine.children.get(&hall).unwrap().len(), 1);
    let err = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_principal_registrations_admit_exactly_one() {
    let engine = Arc::new(new_engine("principal_race.wal"));

    for round in 0..20 {
        let id = format!("clerk-{round}");
        let mut handles = Vec::new();
        for role in [Role::Staff, Role::Scheduler, Role::Admin, Role::Staff] {
            let engine = engine.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .register_principal(Principal::human(&id, role), &Principal::system())
                    .await
            }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(EngineError::AlreadyExists(_)) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(ok, 1, "round {round}");
        assert_eq!(engine.audit_by_target(&AuditTarget::Principal(id)).len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_agent_updates_do_not_lose_each_other() {
    let engine = Arc::new(new_engine("agent_race.wal"));

    for round in 0..20 {
        let id = format!("bot-{round}");
        register_agent(&engine, &id, AgentConfig::ConflictResolver { lookahead_days: 3 }).await;

        let upgrade = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .register_agent(
                        AgentRegistration {
                            agent_id: id,
                            version: "2.0.0".into(),
                            tier: Tier::System,
                            enabled: true,
                            config: AgentConfig::ConflictResolver { lookahead_days: 7 },
                        },
                        &Principal::system(),
                    )
                    .await
            })
        };
        let disable = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move { engine.set_agent_enabled(&id, false, &Principal::system()).await })
        };
        upgrade.await.unwrap().unwrap();
        disable.await.unwrap().unwrap();

        let quota = engine.list_agents().into_iter().find(|a| a.agent_id == id).unwrap();
        assert_eq!(quota.version, "2.0.0", "round {round}");
        assert_eq!(quota.tier, Tier::System);
        // Whichever update committed last decides the flag.
        let last = engine.audit_by_target(&AuditTarget::Agent(id)).pop().unwrap();
        assert_eq!(
            last.metadata.get("enabled").map(String::as_str),
            Some(if quota.enabled { "true" } else { "false" })
        );
    }
}

#[tokio::test]
async fn idle_row_locks_are_pruned() {
    let engine = new_engine("row_locks.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    for hour in 9..12 {
        let id = engine
            .submit_reservation(single(Some(r), DAY + hour * H, DAY + (hour + 1) * H), &cast.scheduler)
            .await
            .unwrap()
            .segments[0]
            .id;
        engine
            .transition_reservation(transition(id, ReservationStatus::Confirmed), &cast.scheduler)
            .await
            .unwrap();
    }
    assert!(!engine.row_locks.is_empty());
    assert!(!engine.principal_locks.is_empty());

    let held = engine.lock_row(r).await;
    engine.prune_locks();
    assert_eq!(engine.row_locks.len(), 1);
    assert!(engine.principal_locks.is_empty());

    drop(held);
    engine.prune_locks();
    assert!(engine.row_locks.is_empty());
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn occupancy_lists_binding_reservations_by_resource() {
    let engine = new_engine("occupancy.wal");
    let cast = register_cast(&engine).await;
    let b = room(&engine, "B room", 10, None).await;
    let a = room(&engine, "A room", 10, None).await;
    engine
        .submit_reservation(single(Some(b), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap();
    engine
        .submit_reservation(single(Some(a), DAY + 11 * H, DAY + 12 * H), &cast.scheduler)
        .await
        .unwrap();
    engine
        .submit_reservation(single(None, DAY + 9 * H, DAY + 12 * H), &cast.staff)
        .await
        .unwrap();

    let rows = engine.occupancy(DAY, DAY + 24 * H).unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.resource_name.as_str()).collect();
    assert_eq!(names, vec!["A room", "B room"]);

    let unresolved = engine.list_reservations(&ReservationFilter {
        status: Some(ReservationStatus::Unresolved),
        ..Default::default()
    });
    assert_eq!(unresolved.len(), 1);
    let for_b = engine.list_reservations(&ReservationFilter {
        resource_id: Some(b),
        ..Default::default()
    });
    assert_eq!(for_b.len(), 1);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("replay.wal");
    let (r, confirmed, pending, audit_len) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), 1500).unwrap();
        let cast = register_cast(&engine).await;
        let r = room(&engine, "Boardroom", 10, None).await;
        let confirmed = engine
            .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
            .await
            .unwrap()
            .segments[0]
            .id;
        engine
            .transition_reservation(transition(confirmed, ReservationStatus::Confirmed), &cast.scheduler)
            .await
            .unwrap();
        let pending = engine
            .submit_reservation(single(Some(r), DAY + 12 * H, DAY + 13 * H), &cast.staff)
            .await
            .unwrap()
            .segments[0]
            .id;
        (r, confirmed, pending, engine.audit_len())
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), 1500).unwrap();
    assert_eq!(engine.audit_len(), audit_len);
    assert_eq!(
        engine.get_reservation(&confirmed).unwrap().status,
        ReservationStatus::Confirmed
    );
    assert_eq!(
        engine.get_reservation(&pending).unwrap().status,
        ReservationStatus::Unresolved
    );
    assert!(engine.principal("sam").is_some());

    let verdict = engine.validate(Some(r), DAY + 9 * H, DAY + 10 * H, None).await.unwrap();
    assert!(!verdict.is_clear());
}

#[tokio::test]
async fn compaction_preserves_state_and_audit_history() {
    let path = test_wal_path("compact.wal");
    let (r, a, audit_len) = {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new()), 1500).unwrap();
        let cast = register_cast(&engine).await;
        let hall = room(&engine, "Hall", 100, None).await;
        let r = room(&engine, "Hall A", 50, Some(hall)).await;
        let a = engine
            .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
            .await
            .unwrap()
            .segments[0]
            .id;
        let b = engine
            .submit_reservation(single(Some(r), DAY + 10 * H, DAY + 11 * H), &cast.scheduler)
            .await
            .unwrap()
            .segments[0]
            .id;
        engine
            .transition_reservation(transition(b, ReservationStatus::Cancelled), &cast.scheduler)
            .await
            .unwrap();

        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (r, a, engine.audit_len())
    };

    let engine = Engine::new(path, Arc::new(NotifyHub::new()), 1500).unwrap();
    assert_eq!(engine.audit_len(), audit_len);
    assert!(engine.get_reservation(&a).is_some());
    assert_eq!(engine.resource_info(&r).unwrap().name, "Hall A");
    assert_eq!(engine.related_resources(r).len(), 1);

    let rs = engine.get_resource(&r).unwrap();
    assert_eq!(rs.read().await.intervals.len(), 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn listeners_see_changes_on_their_resource() {
    let engine = new_engine("notify.wal");
    let cast = register_cast(&engine).await;
    let r = room(&engine, "Boardroom", 10, None).await;
    let mut rx = engine.notify.subscribe(r);

    let id = engine
        .submit_reservation(single(Some(r), DAY + 9 * H, DAY + 10 * H), &cast.scheduler)
        .await
        .unwrap()
        .segments[0]
        .id;
    match rx.recv().await.unwrap() {
        Event::ReservationCreated { reservation } => assert_eq!(reservation.id, id),
        other => panic!("unexpected event {other:?}"),
    }

    engine
        .transition_reservation(transition(id, ReservationStatus::Confirmed), &cast.scheduler)
        .await
        .unwrap();
    assert!(matches!(
        rx.recv().await.unwrap(),
        Event::ReservationConfirmed { .. }
    ));
}
