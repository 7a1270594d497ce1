use crate::config::SchedConfig;
use crate::state::State;
use crate::{MetaKey, Schedule};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::mpsc;
use std::sync::Arc;
use tempfile::TempDir;
use tocsin_common::collect::{tags, Collect};
use tocsin_common::key::{AlertKey, TagSet};
use tocsin_common::types::{Action, ActionType, Event, Silence, Status};
use tocsin_storage::error::{Result as StorageResult, StorageError};
use tocsin_storage::store::SqliteStore;
use tocsin_storage::{
    DataAccess, ErrorStore, IncidentStore, MetadataStore, MetricMetadata, TagMetadata,
};

fn make_sched() -> Arc<Schedule> {
    make_sched_with(SchedConfig::default())
}

fn make_sched_with(config: SchedConfig) -> Arc<Schedule> {
    let collect = Arc::new(Collect::default());
    let store = Arc::new(SqliteStore::open_in_memory(Arc::clone(&collect)).unwrap());
    Arc::new(Schedule::new(config, store, collect))
}

fn ak(s: &str) -> AlertKey {
    s.parse().unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap()
}

fn ev(status: Status, secs: i64) -> Event {
    Event {
        status,
        time: Some(at(secs)),
        ..Default::default()
    }
}

fn close_action(secs: i64) -> Action {
    Action {
        user: "op".into(),
        message: String::new(),
        time: at(secs),
        kind: ActionType::Close,
    }
}

fn seed_state(sched: &Schedule, key: &AlertKey, history: Vec<Event>, need_ack: bool, open: bool) {
    let mut st = State::new(key);
    st.history = history;
    st.need_ack = need_ack;
    st.open = open;
    let mut guard = sched.lock("SeedState");
    guard.status.insert(key.clone(), st);
}

// --- action processing ---------------------------------------------------

#[test]
fn acknowledge_then_close() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    seed_state(
        &sched,
        &key,
        vec![ev(Status::Normal, 1), ev(Status::Critical, 2)],
        true,
        true,
    );

    sched
        .action("u", "looking", ActionType::Acknowledge, &key)
        .unwrap();
    let st = sched.get_status(&key).unwrap();
    assert!(!st.need_ack);
    assert!(st.open);

    // A second acknowledge has nothing to acknowledge.
    let err = sched
        .action("u", "", ActionType::Acknowledge, &key)
        .unwrap_err();
    assert_eq!(err.to_string(), "alert already acknowledged");

    // Still critical: close is rejected and mutates nothing.
    let err = sched.action("u", "", ActionType::Close, &key).unwrap_err();
    assert_eq!(err.to_string(), "cannot close active alert");
    assert!(sched.get_status(&key).unwrap().open);

    sched.apply_event(&key, ev(Status::Normal, 4), None).unwrap();
    sched.action("u", "done", ActionType::Close, &key).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert!(!st.open);
    assert!(!st.need_ack);

    // Closing an already-closed inactive alert stays a no-op success.
    sched.action("u", "again", ActionType::Close, &key).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert!(!st.open);

    // Audit entries and the tagged counter track each accepted action.
    assert_eq!(st.actions.len(), 3);
    assert_eq!(st.actions[0].kind, ActionType::Acknowledge);
    assert_eq!(st.actions[1].kind, ActionType::Close);
    let c = sched.collect();
    assert_eq!(
        c.counter(
            "actions",
            &tags([("user", "u"), ("alert", "cpu"), ("type", "Closed")])
        ),
        2
    );
    assert_eq!(
        c.counter(
            "actions",
            &tags([("user", "u"), ("alert", "cpu"), ("type", "Acknowledged")])
        ),
        1
    );
}

#[test]
fn close_rejection_leaves_need_ack_untouched() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    seed_state(&sched, &key, vec![ev(Status::Critical, 1)], true, true);
    let err = sched.action("u", "", ActionType::Close, &key).unwrap_err();
    assert_eq!(err.to_string(), "cannot close active alert");
    let st = sched.get_status(&key).unwrap();
    assert!(st.need_ack);
    assert!(st.open);
    assert!(st.actions.is_empty());
}

#[test]
fn forget_removes_unknown_state() {
    let sched = make_sched();
    let key = ak("probe{host=gone}");
    seed_state(&sched, &key, vec![ev(Status::Unknown, 1)], true, true);

    sched.action("u", "", ActionType::Forget, &key).unwrap();
    assert!(sched.get_status(&key).is_none());

    let crit = ak("cpu{host=a}");
    seed_state(&sched, &crit, vec![ev(Status::Critical, 1)], false, true);
    let err = sched.action("u", "", ActionType::Forget, &crit).unwrap_err();
    assert_eq!(err.to_string(), "can only forget unknowns");
    assert!(sched.get_status(&crit).is_some());
}

#[test]
fn action_on_unknown_key_or_type_is_rejected() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    let err = sched.action("u", "", ActionType::Close, &key).unwrap_err();
    assert!(err.to_string().starts_with("no such alert key"));

    seed_state(&sched, &key, vec![ev(Status::Critical, 1)], false, true);
    let err = sched.action("u", "", ActionType::None, &key).unwrap_err();
    assert!(err.to_string().starts_with("unknown action type"));
}

#[test]
fn acknowledge_drops_tracked_notifications() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    seed_state(&sched, &key, vec![ev(Status::Critical, 1)], true, true);
    sched.track_notification(&key, "pagers", at(2));
    assert!(sched.tracked_notifications(&key).is_some());

    sched
        .action("u", "", ActionType::Acknowledge, &key)
        .unwrap();
    assert!(sched.tracked_notifications(&key).is_none());
}

// --- evaluation intake ---------------------------------------------------

#[test]
fn apply_event_drives_incident_lifecycle() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");

    sched.apply_event(&key, ev(Status::Normal, 1), None).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.history.len(), 1);
    assert!(!st.open);
    assert_eq!(st.last().incident_id, 0);

    // Normal -> critical opens the state and a new incident.
    sched.apply_event(&key, ev(Status::Critical, 2), None).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert!(st.open);
    assert!(st.need_ack);
    assert_eq!(st.last().incident_id, 1);
    let incident = sched.get_incident(1).unwrap();
    assert_eq!(incident.start, at(2));
    assert!(incident.end.is_none());

    // Worsening/improving inside the open incident stays linked to it.
    sched.apply_event(&key, ev(Status::Warning, 3), None).unwrap();
    assert_eq!(sched.get_status(&key).unwrap().last().incident_id, 1);
    sched.apply_event(&key, ev(Status::Normal, 4), None).unwrap();
    assert_eq!(sched.get_status(&key).unwrap().last().incident_id, 1);

    sched
        .action("u", "", ActionType::Acknowledge, &key)
        .unwrap();
    sched.action("u", "", ActionType::Close, &key).unwrap();
    let incident = sched.get_incident(1).unwrap();
    assert!(incident.end.is_some());
    // The close is written through to the backend copy.
    let stored = sched.data_access().incidents().get(1).unwrap();
    assert_eq!(stored.end, incident.end);

    // A fresh abnormal after the close starts a new incident.
    sched.apply_event(&key, ev(Status::Critical, 5), None).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.last().incident_id, 2);

    // Two incidents now, the first closed, in start order.
    let incidents = sched.get_incidents("cpu", at(0), at(100));
    assert_eq!(incidents.len(), 2);
    assert!(incidents[0].end.is_some());
    assert!(incidents[1].end.is_none());
    assert!(incidents[0].start < incidents[1].start);
}

#[test]
fn apply_event_skips_repeated_status() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    sched.apply_event(&key, ev(Status::Critical, 1), None).unwrap();
    sched.apply_event(&key, ev(Status::Critical, 2), None).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.history.len(), 1);

    sched.apply_event(&key, ev(Status::Warning, 3), None).unwrap();
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.history.len(), 2);
    for pair in st.history.windows(2) {
        assert_ne!(pair[0].status, pair[1].status);
    }
}

#[test]
fn state_copy_is_independent() {
    let key = ak("cpu{host=a}");
    let mut original = State::new(&key);
    original.history.push(ev(Status::Normal, 1));

    let mut copy = original.copy();
    copy.history.push(ev(Status::Critical, 2));
    assert_eq!(original.last().status, Status::Normal);

    original.history.push(ev(Status::Warning, 3));
    assert_eq!(copy.last().status, Status::Critical);

    copy.group.insert("extra".into(), "tag".into());
    assert!(!original.group.contains_key("extra"));
}

#[test]
fn active_tracks_last_status() {
    let key = ak("cpu{host=a}");
    let mut st = State::new(&key);
    assert!(!st.is_active());
    st.append(&ev(Status::Critical, 1));
    assert!(st.is_active());
    st.append(&ev(Status::Normal, 2));
    assert!(!st.is_active());
    assert_eq!(st.abnormal_status(), Status::Critical);
}

// --- incident registry ---------------------------------------------------

#[test]
fn reconstructs_incidents_from_history() {
    let sched = make_sched();
    let key = ak("disk{h=x}");
    {
        let mut st = State::new(&key);
        st.history = vec![
            ev(Status::Normal, 10),
            ev(Status::Warning, 20),
            ev(Status::Critical, 30),
            ev(Status::Normal, 40),
            ev(Status::Warning, 50),
        ];
        st.actions = vec![close_action(45)];
        st.open = true;
        let mut guard = sched.lock("SeedState");
        guard.status.insert(key.clone(), st);
    }

    sched.reconstruct();

    let incidents = sched.get_incidents("", at(0), at(100));
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents[0].id, 1);
    assert_eq!(incidents[0].start, at(20));
    assert_eq!(incidents[0].end, Some(at(45)));
    assert_eq!(incidents[1].id, 2);
    assert_eq!(incidents[1].start, at(50));
    assert_eq!(incidents[1].end, None);

    // The normal event at t=40 sits inside the first incident and is
    // stamped with it; the leading normal is not.
    let st = sched.get_status(&key).unwrap();
    let ids: Vec<u64> = st.history.iter().map(|e| e.incident_id).collect();
    assert_eq!(ids, vec![0, 1, 1, 1, 2]);
}

#[test]
fn reconstruction_id_order_follows_start_then_key() {
    let sched = make_sched();
    let early = ak("zeta{host=z}");
    let late = ak("alpha{host=a}");
    seed_state(&sched, &early, vec![ev(Status::Critical, 10)], false, true);
    seed_state(&sched, &late, vec![ev(Status::Critical, 20)], false, true);
    // Same start for two keys: the smaller key gets the smaller id.
    let tie_a = ak("aaa{host=t}");
    let tie_b = ak("bbb{host=t}");
    seed_state(&sched, &tie_a, vec![ev(Status::Critical, 30)], false, true);
    seed_state(&sched, &tie_b, vec![ev(Status::Critical, 30)], false, true);

    sched.reconstruct();

    let by_id = sched.get_incidents("", at(0), at(100));
    assert_eq!(by_id.len(), 4);
    assert_eq!(by_id[0].alert_key, early);
    assert_eq!(by_id[1].alert_key, late);
    assert_eq!(by_id[2].alert_key, tie_a);
    assert_eq!(by_id[3].alert_key, tie_b);
    for pair in by_id.windows(2) {
        assert!(
            (pair[0].start, &pair[0].alert_key) < (pair[1].start, &pair[1].alert_key)
        );
    }
}

#[test]
fn reconstruction_is_idempotent() {
    let sched = make_sched();
    let key = ak("disk{h=x}");
    {
        let mut st = State::new(&key);
        st.history = vec![
            ev(Status::Warning, 20),
            ev(Status::Normal, 40),
            ev(Status::Critical, 60),
        ];
        st.actions = vec![close_action(45)];
        st.open = true;
        let mut guard = sched.lock("SeedState");
        guard.status.insert(key.clone(), st);
    }

    sched.reconstruct();
    let first: Vec<_> = sched
        .get_incidents("", at(0), at(100))
        .into_iter()
        .map(|i| (i.alert_key, i.start, i.end))
        .collect();

    sched.reconstruct();
    let second: Vec<_> = sched
        .get_incidents("", at(0), at(100))
        .into_iter()
        .map(|i| (i.alert_key, i.start, i.end))
        .collect();

    assert_eq!(first, second);
    // The id counter never rewinds across rebuilds.
    let next = sched.lock_incidents().max_incident_id;
    assert_eq!(next, 4);
}

#[test]
fn incident_event_and_action_boundaries() {
    let sched = make_sched();
    let key = ak("disk{h=x}");
    {
        let mut st = State::new(&key);
        st.history = vec![ev(Status::Warning, 20), ev(Status::Normal, 45)];
        st.actions = vec![close_action(45)];
        st.open = true;
        let mut guard = sched.lock("SeedState");
        guard.status.insert(key.clone(), st);
    }
    sched.reconstruct();

    // The event at exactly the end time is outside the incident...
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.history[0].incident_id, 1);
    assert_eq!(st.history[1].incident_id, 0);

    // ...but the close action at that same instant is part of it.
    let (incident, events, actions) = sched.get_incident_events(1).unwrap();
    assert_eq!(incident.end, Some(at(45)));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].time, Some(at(20)));
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].time, at(45));
}

#[test]
fn get_incidents_filters_by_alert_and_window() {
    let sched = make_sched();
    let cpu = ak("cpu{host=a}");
    let mem = ak("mem{host=a}");
    seed_state(&sched, &cpu, vec![ev(Status::Critical, 10)], false, true);
    seed_state(&sched, &mem, vec![ev(Status::Critical, 50)], false, true);
    sched.reconstruct();

    assert_eq!(sched.get_incidents("cpu", at(0), at(100)).len(), 1);
    assert_eq!(sched.get_incidents("", at(0), at(100)).len(), 2);
    assert_eq!(sched.get_incidents("", at(0), at(20)).len(), 1);
    assert!(sched.get_incident(99).is_err());
}

// --- grouping ------------------------------------------------------------

#[test]
fn grouping_covers_by_common_tag_then_singletons() {
    let config = SchedConfig {
        min_group_size: 3,
        ..Default::default()
    };
    let sched = make_sched_with(config);
    let specs = [
        ("a1", "a", "x"),
        ("a2", "b", "x"),
        ("a3", "c", "x"),
        ("a4", "d", "y"),
        ("a5", "e", "y"),
        ("a6", "f", "z"),
    ];
    for (alert, host, dc) in specs {
        let key = ak(&format!("{alert}{{dc={dc},host={host}}}"));
        seed_state(&sched, &key, vec![ev(Status::Critical, 1)], false, true);
    }

    let out = sched.marshal_groups("").unwrap();
    assert!(out.groups.need_ack.is_empty());
    let top = &out.groups.acknowledged;
    assert_eq!(top.len(), 4);

    let dcx = top
        .iter()
        .find(|g| g.subject == "critical - {dc=x}")
        .expect("dc=x cover group");
    assert_eq!(dcx.children.len(), 3);

    // Exhaustive and disjoint: every open state appears in exactly one leaf.
    let mut leaves: Vec<String> = top
        .iter()
        .flat_map(|g| g.children.iter())
        .filter_map(|c| c.alert_key.as_ref().map(|k| k.to_string()))
        .collect();
    assert_eq!(leaves.len(), 6);
    leaves.sort();
    leaves.dedup();
    assert_eq!(leaves.len(), 6);
}

#[test]
fn grouping_falls_back_to_alert_name() {
    let config = SchedConfig {
        min_group_size: 2,
        ..Default::default()
    };
    let sched = make_sched_with(config);
    // No shared tag pair, but a shared alert name.
    seed_state(
        &sched,
        &ak("cpu{host=a}"),
        vec![ev(Status::Warning, 1)],
        false,
        true,
    );
    seed_state(
        &sched,
        &ak("cpu{host=b}"),
        vec![ev(Status::Warning, 1)],
        false,
        true,
    );

    let out = sched.marshal_groups("").unwrap();
    let top = &out.groups.acknowledged;
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].subject, "warning - cpu");
    assert_eq!(top[0].children.len(), 2);
}

#[test]
fn grouping_splits_by_acknowledgement_and_silence() {
    let sched = make_sched();
    let noisy = ak("cpu{host=a}");
    let quiet = ak("mem{host=b}");
    seed_state(&sched, &noisy, vec![ev(Status::Critical, 1)], true, true);
    seed_state(&sched, &quiet, vec![ev(Status::Critical, 1)], false, true);
    let now = Utc::now();
    sched.set_silence(
        "window-1",
        Silence {
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            alert: "mem".into(),
            ..Default::default()
        },
    );

    let silenced = sched.silenced();
    assert!(silenced.contains_key(&quiet));
    assert!(!silenced.contains_key(&noisy));

    let out = sched.marshal_groups("").unwrap();
    assert_eq!(out.groups.need_ack.len(), 1);
    assert!(!out.groups.need_ack[0].silenced);
    assert_eq!(out.groups.acknowledged.len(), 1);
    assert!(out.groups.acknowledged[0].silenced);
}

#[test]
fn grouping_trims_child_snapshots() {
    let sched = make_sched();
    let key = ak("cpu{host=a}");
    {
        let mut st = State::new(&key);
        st.history = vec![ev(Status::Normal, 1), ev(Status::Critical, 2)];
        st.actions = vec![close_action(3), close_action(4)];
        st.subject = "cpu is hot".into();
        st.body = "long rendered body".into();
        st.email_body = b"mime".to_vec();
        st.open = true;
        let mut guard = sched.lock("SeedState");
        guard.status.insert(key.clone(), st);
    }

    let out = sched.marshal_groups("").unwrap();
    let group = &out.groups.acknowledged[0];
    // Sole child with a subject: the parent takes it over.
    assert_eq!(group.subject, "cpu is hot");
    let child = &group.children[0];
    let snapshot = child.state.as_ref().unwrap();
    assert_eq!(snapshot.history.len(), 1);
    assert_eq!(snapshot.history[0].status, Status::Critical);
    assert_eq!(snapshot.actions.len(), 1);
    assert!(snapshot.body.is_empty());
    assert!(snapshot.email_body.is_empty());
    assert!(!child.ago.is_empty());

    // The live state is untouched by the trim.
    let live = sched.get_status(&key).unwrap();
    assert_eq!(live.history.len(), 2);
    assert_eq!(live.body, "long rendered body");
}

#[test]
fn grouping_filter_is_a_glob() {
    let sched = make_sched();
    seed_state(&sched, &ak("cpu{host=a}"), vec![ev(Status::Critical, 1)], false, true);
    seed_state(&sched, &ak("mem{host=a}"), vec![ev(Status::Critical, 1)], false, true);

    let out = sched.marshal_groups("cpu*").unwrap();
    let leaves: Vec<_> = out
        .groups
        .acknowledged
        .iter()
        .flat_map(|g| g.children.iter())
        .collect();
    assert_eq!(leaves.len(), 1);
    assert_eq!(leaves[0].alert, "cpu");
}

#[test]
fn group_sort_puts_active_and_worse_first() {
    let sched = make_sched();
    // Inactive unknown (last normal, abnormal unknown) vs active warning.
    seed_state(
        &sched,
        &ak("a{host=1}"),
        vec![ev(Status::Unknown, 1), ev(Status::Normal, 2)],
        false,
        true,
    );
    seed_state(&sched, &ak("b{host=2}"), vec![ev(Status::Warning, 1)], false, true);

    let out = sched.marshal_groups("").unwrap();
    let top = &out.groups.acknowledged;
    assert_eq!(top.len(), 2);
    assert!(top[0].active);
    assert_eq!(top[0].status, Status::Warning);
    assert!(!top[1].active);
    assert_eq!(top[1].status, Status::Unknown);
}

// --- snapshots -----------------------------------------------------------

#[test]
fn open_state_snapshot_filters_and_copies() {
    let sched = make_sched();
    let open_key = ak("cpu{host=a}");
    let closed_key = ak("mem{host=b}");
    seed_state(&sched, &open_key, vec![ev(Status::Critical, 1)], false, true);
    seed_state(&sched, &closed_key, vec![ev(Status::Normal, 1)], false, false);

    let mut snapshot = sched.get_open_states();
    assert_eq!(snapshot.len(), 1);
    // Mutating the snapshot never touches the live store.
    let st = snapshot.get_mut(&open_key).unwrap();
    st.history.push(ev(Status::Normal, 2));
    assert_eq!(sched.get_status(&open_key).unwrap().history.len(), 1);
}

// --- lock instrumentation ------------------------------------------------

#[test]
fn lock_wait_and_hold_are_recorded() {
    let sched = make_sched();
    let (tx, rx) = mpsc::channel();
    let holder = {
        let sched = Arc::clone(&sched);
        std::thread::spawn(move || {
            let _g = sched.lock("Holder");
            tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        })
    };
    rx.recv().unwrap();
    {
        let _g = sched.lock("Action");
        std::thread::sleep(std::time::Duration::from_millis(7));
    }
    holder.join().unwrap();

    let c = sched.collect();
    let wait = c.counter(
        "schedule.lock_time",
        &tags([("caller", "Action"), ("op", "wait")]),
    );
    let hold = c.counter(
        "schedule.lock_time",
        &tags([("caller", "Action"), ("op", "hold")]),
    );
    assert!(wait >= 5, "wait was {wait}ms");
    assert!(hold >= 6, "hold was {hold}ms");
    assert_eq!(
        c.counter("schedule.lock_count", &tags([("caller", "Action")])),
        1
    );
    assert_eq!(
        c.counter("schedule.lock_count", &tags([("caller", "Holder")])),
        1
    );
    assert!(sched.lock_status().is_none());
}

// --- persistence ---------------------------------------------------------

#[test]
fn save_and_restore_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = SchedConfig {
        state_file: Some(dir.path().join("state.json")),
        ..Default::default()
    };
    let key = ak("cpu{host=a}");

    {
        let sched = make_sched_with(config.clone());
        sched.apply_event(&key, ev(Status::Critical, 2), None).unwrap();
        let now = Utc::now();
        sched.set_silence(
            "maintenance",
            Silence {
                start: now,
                end: now + Duration::hours(4),
                alert: "cpu".into(),
                ..Default::default()
            },
        );
        sched.track_notification(&key, "pagers", at(3));
        sched.close().unwrap();
    }

    let sched = make_sched_with(config);
    sched.load().unwrap();

    let st = sched.get_status(&key).unwrap();
    assert!(st.open);
    assert!(st.need_ack);
    assert_eq!(st.last().status, Status::Critical);
    assert_eq!(st.last().incident_id, 1);
    let incident = sched.get_incident(1).unwrap();
    assert_eq!(incident.alert_key, key);
    assert!(sched.tracked_notifications(&key).is_some());
    assert_eq!(sched.silenced().len(), 1);

    // The restored counter keeps new ids monotone, even on a fresh backend.
    sched
        .apply_event(&ak("mem{host=b}"), ev(Status::Critical, 9), None)
        .unwrap();
    let st = sched.get_status(&ak("mem{host=b}")).unwrap();
    assert_eq!(st.last().incident_id, 2);

    let reported = sched.collect().gauge("statefile.size", &TagSet::new());
    assert!(reported.is_none()); // gauge belongs to the writing process
}

#[test]
fn restore_without_incidents_rebuilds_them() {
    let dir = TempDir::new().unwrap();
    let config = SchedConfig {
        state_file: Some(dir.path().join("state.json")),
        ..Default::default()
    };
    let key = ak("disk{h=x}");

    {
        let sched = make_sched_with(config.clone());
        // History recorded before incident tracking existed: events only.
        {
            let mut st = State::new(&key);
            st.history = vec![ev(Status::Normal, 10), ev(Status::Warning, 20)];
            st.open = true;
            let mut guard = sched.lock("SeedState");
            guard.status.insert(key.clone(), st);
        }
        sched.save().unwrap();
    }

    let sched = make_sched_with(config);
    sched.load().unwrap();
    let incidents = sched.get_incidents("", at(0), at(100));
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].start, at(20));
    let st = sched.get_status(&key).unwrap();
    assert_eq!(st.history[1].incident_id, incidents[0].id);
}

#[test]
fn run_loop_saves_and_stops_on_close() {
    let dir = TempDir::new().unwrap();
    let config = SchedConfig {
        state_file: Some(dir.path().join("state.json")),
        save_interval_secs: 1,
        ..Default::default()
    };
    let sched = make_sched_with(config);
    let runner = {
        let sched = Arc::clone(&sched);
        std::thread::spawn(move || sched.run().unwrap())
    };
    std::thread::sleep(std::time::Duration::from_millis(1200));
    sched.close().unwrap();
    runner.join().unwrap();
    assert!(dir.path().join("state.json").exists());
    assert!(sched
        .collect()
        .gauge("statefile.size", &TagSet::new())
        .is_some());
}

#[test]
fn save_without_state_file_is_disabled() {
    let sched = make_sched();
    sched.save().unwrap();
    assert!(sched.collect().gauge("statefile.size", &TagSet::new()).is_none());
}

#[test]
fn state_json_omits_notification_blobs_when_cleared() {
    let key = ak("cpu{host=a}");
    let mut st = State::new(&key);
    st.history = vec![ev(Status::Critical, 1)];
    st.subject = "subject line".into();
    st.email_body = Vec::new();
    st.attachments = Vec::new();
    let js = serde_json::to_value(&st).unwrap();
    assert!(js.get("email_body").is_none());
    assert!(js.get("attachments").is_none());
    assert_eq!(js["subject"], "subject line");

    let back: State = serde_json::from_value(js).unwrap();
    assert_eq!(back.last().status, Status::Critical);
}

// --- metadata and error passthrough --------------------------------------

#[test]
fn metadata_routing_and_validation() {
    let sched = make_sched();

    sched
        .put_metadata(
            &MetaKey {
                metric: "os.cpu".into(),
                tags: TagSet::new(),
                name: "desc".into(),
            },
            &serde_json::json!("cpu usage"),
        )
        .unwrap();
    let meta = sched.metadata_metrics("os.cpu").unwrap();
    assert_eq!(meta.desc, "cpu usage");

    // Core fields demand a metric name and a string value.
    assert!(sched
        .put_metadata(
            &MetaKey {
                metric: String::new(),
                tags: TagSet::new(),
                name: "unit".into(),
            },
            &serde_json::json!("percent"),
        )
        .is_err());
    assert!(sched
        .put_metadata(
            &MetaKey {
                metric: "os.cpu".into(),
                tags: TagSet::new(),
                name: "rate".into(),
            },
            &serde_json::json!(42),
        )
        .is_err());

    // Anything else lands in tag metadata, stringified.
    let host_tags = tags([("host", "web-01")]);
    sched
        .put_metadata(
            &MetaKey {
                metric: String::new(),
                tags: host_tags.clone(),
                name: "memory_total".into(),
            },
            &serde_json::json!(64),
        )
        .unwrap();
    let entries = sched.get_metadata("", &host_tags).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "memory_total");
    assert_eq!(entries[0].value, "64");
    assert!(entries[0].time.is_some());

    let entries = sched.get_metadata("os.cpu", &TagSet::new()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "desc");

    sched.delete_metadata(&host_tags, "memory_total").unwrap();
    assert!(sched.get_metadata("", &host_tags).unwrap().is_empty());
}

#[test]
fn error_counts_flow_through() {
    let sched = make_sched();
    assert!(sched.alert_successful("cpu"));
    sched.mark_alert_error("cpu", "query timeout");
    assert!(!sched.alert_successful("cpu"));
    assert_eq!(sched.get_error_counts(), (1, 1));
    sched.mark_alert_success("cpu");
    assert!(sched.alert_successful("cpu"));
    assert_eq!(sched.get_error_counts(), (0, 1));
    sched.clear_errors("all").unwrap();
    assert_eq!(sched.get_error_counts(), (0, 0));
}

// --- pessimistic defaults on a failing backend ---------------------------

struct FailingStore;

fn down<T>() -> StorageResult<T> {
    Err(StorageError::Other("backend down".into()))
}

impl IncidentStore for FailingStore {
    fn get(&self, _id: u64) -> StorageResult<tocsin_common::types::Incident> {
        down()
    }
    fn create(
        &self,
        _ak: &AlertKey,
        _start: DateTime<Utc>,
    ) -> StorageResult<tocsin_common::types::Incident> {
        down()
    }
    fn update(&self, _id: u64, _incident: &tocsin_common::types::Incident) -> StorageResult<()> {
        down()
    }
    fn raise_max_id(&self, _to: u64) -> StorageResult<()> {
        down()
    }
}

impl MetadataStore for FailingStore {
    fn put_metric_metadata(&self, _m: &str, _n: &str, _v: &str) -> StorageResult<()> {
        down()
    }
    fn get_metric_metadata(&self, _m: &str) -> StorageResult<MetricMetadata> {
        down()
    }
    fn put_tag_metadata(
        &self,
        _t: &TagSet,
        _n: &str,
        _v: &str,
        _at: DateTime<Utc>,
    ) -> StorageResult<()> {
        down()
    }
    fn get_tag_metadata(&self, _t: &TagSet, _n: &str) -> StorageResult<Vec<TagMetadata>> {
        down()
    }
    fn delete_tag_metadata(&self, _t: &TagSet, _n: &str) -> StorageResult<()> {
        down()
    }
}

impl ErrorStore for FailingStore {
    fn is_alert_failing(&self, _name: &str) -> StorageResult<bool> {
        down()
    }
    fn mark_alert_failure(&self, _name: &str, _msg: &str) -> StorageResult<()> {
        down()
    }
    fn mark_alert_success(&self, _name: &str) -> StorageResult<()> {
        down()
    }
    fn clear_alert(&self, _name: &str) -> StorageResult<()> {
        down()
    }
    fn clear_all(&self) -> StorageResult<()> {
        down()
    }
    fn failing_alert_counts(&self) -> StorageResult<(usize, usize)> {
        down()
    }
}

impl DataAccess for FailingStore {
    fn incidents(&self) -> &dyn IncidentStore {
        self
    }
    fn metadata(&self) -> &dyn MetadataStore {
        self
    }
    fn errors(&self) -> &dyn ErrorStore {
        self
    }
}

#[test]
fn failing_error_backend_reads_as_unsuccessful() {
    let collect = Arc::new(Collect::default());
    let sched = Schedule::new(SchedConfig::default(), Arc::new(FailingStore), collect);
    assert!(!sched.alert_successful("cpu"));
    assert_eq!(sched.get_error_counts(), (0, 0));
}

#[test]
fn failing_incident_backend_surfaces_from_intake() {
    let collect = Arc::new(Collect::default());
    let sched = Schedule::new(SchedConfig::default(), Arc::new(FailingStore), collect);
    let key = ak("cpu{host=a}");
    let err = sched
        .apply_event(&key, ev(Status::Critical, 1), None)
        .unwrap_err();
    assert!(err.to_string().contains("backend down"));
}
