/// Predicate query tests
///
/// Filters per field type, result modes, point-in-time queries and the
/// listing helpers.
/// Run with: cargo test --test query_tests

mod common;

use common::{Fixture, fixture};
use rowchain::{FieldValue, LogicalId, Pick, StoreError};

fn seeded() -> (Fixture, Vec<LogicalId>) {
    let fx = fixture();
    let ids = [
        ("Login fails", "bug ui-kit"),
        ("Slow search", "perf"),
        ("Crash on save", "bug urgent"),
    ]
    .iter()
    .map(|(title, labels)| fx.ticket(title, labels).logical_id().unwrap())
    .collect();
    (fx, ids)
}

#[test]
fn test_filter_by_text_and_bool() {
    let (fx, ids) = seeded();
    let found = fx.store.query("Ticket").filter("title", "Slow search").all().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].logical_id(), Some(ids[1]));

    let open = fx.store.query("Ticket").filter("done", false).count().unwrap();
    assert_eq!(open, 3);
}

#[test]
fn test_tag_filter_rechecks_exact_membership() {
    let (fx, ids) = seeded();

    let bugs = fx.store.query("Ticket").filter("labels", "bug").ids().unwrap();
    assert_eq!(bugs, vec![ids[0], ids[2]]);

    // Full-text search matches the `ui` token inside `ui-kit`; the exact
    // re-check does not.
    let ui = fx.store.query("Ticket").filter("labels", "ui").all().unwrap();
    assert!(ui.is_empty());
    assert_eq!(fx.store.query("Ticket").filter("labels", "ui").count().unwrap(), 0);

    let both = fx
        .store
        .query("Ticket")
        .filter("labels", vec!["urgent", "bug"])
        .unique()
        .unwrap()
        .unwrap();
    assert_eq!(both.logical_id(), Some(ids[2]));
}

#[test]
fn test_empty_value_matches_unset_fields() {
    let (fx, ids) = seeded();
    let mut ticket = fx.store.get("Ticket", ids[0], Default::default()).unwrap().unwrap();
    ticket.set_list("path", ["web", "auth"]).unwrap();
    fx.store.save(&mut ticket).unwrap();

    let unset = fx
        .store
        .query("Ticket")
        .filter("path", FieldValue::List(Vec::new()))
        .ids()
        .unwrap();
    assert_eq!(unset, vec![ids[1], ids[2]]);

    let by_path = fx.store.query("Ticket").filter("path", "web/auth").ids().unwrap();
    assert_eq!(by_path, vec![ids[0]]);
    let wrong_order = fx
        .store
        .query("Ticket")
        .filter("path", vec!["auth", "web"])
        .ids()
        .unwrap();
    assert!(wrong_order.is_empty());
}

#[test]
fn test_unique_rejects_multiple_matches() {
    let (fx, _) = seeded();
    let err = fx
        .store
        .query("Ticket")
        .filter("labels", "bug")
        .unique()
        .unwrap_err();
    assert!(matches!(err, StoreError::NotUnique(2)));
    assert!(
        fx.store
            .query("Ticket")
            .filter("title", "nothing")
            .unique()
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_deleted_records_excluded_unless_requested() {
    let (fx, ids) = seeded();
    let mut ticket = fx.store.get("Ticket", ids[1], Default::default()).unwrap().unwrap();
    fx.store.remove(&mut ticket).unwrap();

    assert_eq!(fx.store.query("Ticket").count().unwrap(), 2);
    let with_deleted = fx.store.query("Ticket").include_deleted().ids().unwrap();
    assert_eq!(with_deleted.len(), 3);
    assert!(with_deleted.contains(&ids[1]));
}

#[test]
fn test_select_picks_first_or_last_matching_version() {
    let (fx, ids) = seeded();
    let mut ticket = fx.store.get("Ticket", ids[0], Default::default()).unwrap().unwrap();
    for title in ["Login fails again", "Login fixed"] {
        fx.tick();
        ticket.set_text("title", title).unwrap();
        fx.store.save(&mut ticket).unwrap();
    }
    fx.tick();
    ticket.set_text("labels", "ui-kit").unwrap();
    fx.store.save(&mut ticket).unwrap();

    let first = fx
        .store
        .query("Ticket")
        .filter("labels", "bug")
        .select(Pick::First)
        .all()
        .unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].text("title").unwrap(), "Login fails");

    let last = fx
        .store
        .query("Ticket")
        .filter("labels", "bug")
        .select(Pick::Last)
        .all()
        .unwrap();
    assert_eq!(last[0].logical_id(), Some(ids[0]));
    assert_eq!(last[0].text("title").unwrap(), "Login fixed");
    assert!(!last[0].is_current());
}

#[test]
fn test_select_conflicts_are_invalid_arguments() {
    let (fx, _) = seeded();
    let now = fx.tick();
    assert!(matches!(
        fx.store.query("Ticket").select(Pick::First).unique(),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.store.query("Ticket").select(Pick::Last).count(),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.store.query("Ticket").select(Pick::Last).as_of(now).all(),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_bad_filters_are_reported() {
    let (fx, _) = seeded();
    assert!(matches!(
        fx.store.query("Ticket").filter("owner", "ann").all(),
        Err(StoreError::UnknownField { .. })
    ));
    assert!(matches!(
        fx.store.query("Ticket").filter("done", "yes").all(),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.store.query("Sprint").all(),
        Err(StoreError::Configuration(_))
    ));
}

#[test]
fn test_as_of_query_judges_version_current_then() {
    let (fx, ids) = seeded();
    let before = fx.clock.advance(chrono::Duration::zero());

    fx.tick();
    let mut ticket = fx.store.get("Ticket", ids[1], Default::default()).unwrap().unwrap();
    ticket.set_text("labels", "perf bug").unwrap();
    fx.store.save(&mut ticket).unwrap();

    let mut crash = fx.store.get("Ticket", ids[2], Default::default()).unwrap().unwrap();
    crash.set_text("labels", "urgent").unwrap();
    fx.store.save(&mut crash).unwrap();
    let after = fx.tick();

    let then: Vec<_> = fx
        .store
        .query("Ticket")
        .filter("labels", "bug")
        .as_of(before)
        .all()
        .unwrap()
        .iter()
        .filter_map(|t| t.logical_id())
        .collect();
    assert_eq!(then, vec![ids[0], ids[2]]);

    let now = fx
        .store
        .query("Ticket")
        .filter("labels", "bug")
        .as_of(after)
        .ids()
        .unwrap();
    assert_eq!(now, vec![ids[0], ids[1]]);
}

#[test]
fn test_query_or_create() {
    let (fx, ids) = seeded();
    let found = fx
        .store
        .query_or_create("Ticket", &[("title", FieldValue::from("Slow search"))])
        .unwrap();
    assert_eq!(found.logical_id(), Some(ids[1]));

    let created = fx
        .store
        .query_or_create(
            "Ticket",
            &[
                ("title", FieldValue::from("New one")),
                ("labels", FieldValue::from("triage")),
            ],
        )
        .unwrap();
    assert!(created.is_persisted());
    assert_eq!(created.list("labels").unwrap(), ["triage"]);
    assert_eq!(fx.store.query("Ticket").count().unwrap(), 4);
}

#[test]
fn test_sorted_by_and_regex_match() {
    let (fx, ids) = seeded();
    let titles: Vec<_> = fx
        .store
        .sorted_by("Ticket", "title")
        .unwrap()
        .iter()
        .map(|t| t.text("title").unwrap().to_string())
        .collect();
    assert_eq!(titles, vec!["Crash on save", "Login fails", "Slow search"]);

    assert_eq!(
        fx.store.regex_match_ids("Ticket", "title", "^(Login|Slow)").unwrap(),
        vec![ids[0], ids[1]]
    );
    assert!(matches!(
        fx.store.regex_match("Ticket", "title", "(unclosed"),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fx.store.sorted_by("Ticket", "done"),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_choose_and_all() {
    let (fx, ids) = seeded();
    assert_eq!(fx.store.all("Ticket").unwrap().len(), 3);
    let short = fx
        .store
        .choose("Ticket", |t| t.text("title").map(|s| s.len() < 12).unwrap_or(false))
        .unwrap();
    assert_eq!(short.len(), 2);
    assert!(short.iter().all(|t| t.logical_id() != Some(ids[2])));
}
