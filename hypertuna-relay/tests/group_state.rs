//! Group projection laws and ordering scenarios.

use std::sync::Arc;
use std::time::Duration;

use hypertuna_relay::auth::AuthTokenStore;
use hypertuna_relay::group::Groups;
use hypertuna_sdk::event::{Event, EventBuilder, Role};
use hypertuna_sdk::events::{EventBus, GroupEvent};
use hypertuna_sdk::Keys;

const GROUP: &str = "grp1";

struct Fixture {
    groups: Groups,
    auth: Arc<AuthTokenStore>,
    bus: EventBus,
    admin: Keys,
}

/// A projection whose local user is `local` (defaults to a bystander).
fn fixture_with_local(local: Keys) -> Fixture {
    let bus = EventBus::new();
    let auth = Arc::new(AuthTokenStore::new(bus.clone()));
    let groups = Groups::with_debounce(
        local.clone(),
        Arc::clone(&auth),
        bus.clone(),
        Duration::from_millis(100),
    );
    let admin = Keys::generate();
    let create = EventBuilder::group_create(GROUP, "fixture group")
        .unwrap()
        .sign_at(&admin, 1)
        .unwrap();
    groups.apply(&create).unwrap();
    Fixture {
        groups,
        auth,
        bus,
        admin,
    }
}

fn fixture() -> Fixture {
    fixture_with_local(Keys::generate())
}

fn add_user(admin: &Keys, pubkey: &str, roles: &[Role], token: Option<&str>, ts: u64) -> Event {
    EventBuilder::add_user(GROUP, pubkey, roles, token)
        .unwrap()
        .sign_at(admin, ts)
        .unwrap()
}

fn remove_user(author: &Keys, pubkey: &str, ts: u64) -> Event {
    EventBuilder::remove_user(GROUP, pubkey)
        .unwrap()
        .sign_at(author, ts)
        .unwrap()
}

fn members_snapshot(author: &Keys, members: &[&str], ts: u64) -> Event {
    EventBuilder::group_members(GROUP, members.iter().copied())
        .unwrap()
        .sign_at(author, ts)
        .unwrap()
}

#[tokio::test]
async fn ordered_membership_is_timestamp_only() {
    // 9000(ts=10), 9001(ts=20), 9000(ts=15): max ADDS = 15 ≤ REMOVES = 20,
    // so the user is out regardless of arrival order.
    let f = fixture();
    let b = Keys::generate().public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Member], None, 10))
        .unwrap();
    f.groups.apply(&remove_user(&f.admin, &b, 20)).unwrap();
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Member], None, 15))
        .unwrap();
    assert!(!f.groups.members(GROUP).contains(&b));

    // A later re-add readmits.
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Member], None, 21))
        .unwrap();
    assert!(f.groups.members(GROUP).contains(&b));
}

#[tokio::test]
async fn removal_at_equal_timestamp_wins() {
    let f = fixture();
    let b = Keys::generate().public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Member], None, 50))
        .unwrap();
    f.groups.apply(&remove_user(&f.admin, &b, 50)).unwrap();
    // Effective membership needs ADDS.ts strictly greater.
    assert!(!f.groups.members(GROUP).contains(&b));
}

#[tokio::test]
async fn authoritative_overwrite_keeps_newer_snapshot() {
    // 39002(ts=100, [A,B]) then 39002(ts=50, [A]) → [A, B].
    let f = fixture();
    let a = Keys::generate().public_key_hex();
    let b = Keys::generate().public_key_hex();
    f.groups
        .apply(&members_snapshot(&f.admin, &[&a, &b], 100))
        .unwrap();
    f.groups
        .apply(&members_snapshot(&f.admin, &[&a], 50))
        .unwrap();
    let members = f.groups.members(GROUP);
    assert!(members.contains(&a));
    assert!(members.contains(&b));
}

#[tokio::test]
async fn snapshot_commutativity() {
    // Applying two member snapshots in either order converges on the
    // higher-created_at one.
    let a = Keys::generate().public_key_hex();
    let b = Keys::generate().public_key_hex();
    let c = Keys::generate().public_key_hex();

    let f1 = fixture();
    let newer = members_snapshot(&f1.admin, &[&a, &b], 200);
    let older = members_snapshot(&f1.admin, &[&a, &c], 150);
    f1.groups.apply(&newer).unwrap();
    f1.groups.apply(&older).unwrap();

    let f2 = fixture();
    // Same events, re-signed by f2's admin for its own projection.
    let newer2 = members_snapshot(&f2.admin, &[&a, &b], 200);
    let older2 = members_snapshot(&f2.admin, &[&a, &c], 150);
    f2.groups.apply(&older2).unwrap();
    f2.groups.apply(&newer2).unwrap();

    assert_eq!(f1.groups.members(GROUP), f2.groups.members(GROUP));
    assert!(!f1.groups.members(GROUP).contains(&c));
}

#[tokio::test]
async fn targeted_add_beats_snapshot_seed_at_same_timestamp() {
    let f = fixture();
    let b = Keys::generate().public_key_hex();

    // Snapshot first, targeted add second: the 9000's roles stick.
    f.groups
        .apply(&members_snapshot(&f.admin, &[&b], 100))
        .unwrap();
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Admin], None, 100))
        .unwrap();
    let roles = f
        .groups
        .with_group(GROUP, |g| g.roles_of(&b))
        .unwrap();
    assert!(roles.contains(&Role::Admin));

    // Reverse order: the snapshot seed must not clobber the 9000.
    let f = fixture();
    f.groups
        .apply(&add_user(&f.admin, &b, &[Role::Admin], None, 100))
        .unwrap();
    f.groups
        .apply(&members_snapshot(&f.admin, &[&b], 100))
        .unwrap();
    let roles = f
        .groups
        .with_group(GROUP, |g| g.roles_of(&b))
        .unwrap();
    assert!(roles.contains(&Role::Admin));
}

#[tokio::test]
async fn duplicate_application_is_idempotent() {
    let f = fixture();
    let b = Keys::generate().public_key_hex();
    let event = add_user(&f.admin, &b, &[Role::Member], None, 10);
    assert!(f.groups.apply(&event).unwrap());
    assert!(!f.groups.apply(&event).unwrap());
    assert_eq!(
        f.groups.members(GROUP).iter().filter(|m| **m == b).count(),
        1
    );
}

#[tokio::test]
async fn stale_metadata_snapshot_dropped() {
    let f = fixture();
    let newer = EventBuilder::group_metadata(GROUP, "newer", "", true, false)
        .unwrap()
        .sign_at(&f.admin, 100)
        .unwrap();
    let older = EventBuilder::group_metadata(GROUP, "older", "", true, false)
        .unwrap()
        .sign_at(&f.admin, 50)
        .unwrap();
    f.groups.apply(&newer).unwrap();
    f.groups.apply(&older).unwrap();
    let name = f
        .groups
        .with_group(GROUP, |g| g.metadata.name.clone())
        .unwrap();
    assert_eq!(name, "newer");
}

#[tokio::test]
async fn add_token_lands_in_auth_store_for_local_user_only() {
    let local = Keys::generate();
    let f = fixture_with_local(local.clone());
    let local_pk = local.public_key_hex();
    let other = Keys::generate().public_key_hex();

    f.groups
        .apply(&add_user(&f.admin, &other, &[Role::Member], Some("tok-other"), 10))
        .unwrap();
    assert_eq!(f.auth.verify_auth(GROUP, "tok-other"), None);

    f.groups
        .apply(&add_user(&f.admin, &local_pk, &[Role::Member], Some("tok-mine"), 11))
        .unwrap();
    assert_eq!(
        f.auth.verify_auth(GROUP, "tok-mine").as_deref(),
        Some(local_pk.as_str())
    );
}

#[tokio::test]
async fn removal_revokes_token() {
    let local = Keys::generate();
    let f = fixture_with_local(local.clone());
    let local_pk = local.public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &local_pk, &[Role::Member], Some("tok"), 10))
        .unwrap();
    assert!(f.auth.verify_auth(GROUP, "tok").is_some());

    f.groups.apply(&remove_user(&f.admin, &local_pk, 20)).unwrap();
    assert_eq!(f.auth.verify_auth(GROUP, "tok"), None);
}

#[tokio::test]
async fn join_request_cleared_by_matching_add() {
    let f = fixture();
    let candidate = Keys::generate();
    let request = EventBuilder::join_request(GROUP, "let me in")
        .unwrap()
        .sign_at(&candidate, 10)
        .unwrap();
    f.groups.apply(&request).unwrap();
    let pending = f
        .groups
        .with_group(GROUP, |g| g.join_requests().len())
        .unwrap();
    assert_eq!(pending, 1);

    f.groups
        .apply(&add_user(&f.admin, &candidate.public_key_hex(), &[Role::Member], None, 11))
        .unwrap();
    let pending = f
        .groups
        .with_group(GROUP, |g| g.join_requests().len())
        .unwrap();
    assert_eq!(pending, 0);
}

#[tokio::test]
async fn messages_ordered_by_created_at_then_id() {
    let f = fixture();
    let author = Keys::generate();
    let m_late = EventBuilder::group_message(GROUP, "late")
        .unwrap()
        .sign_at(&author, 30)
        .unwrap();
    let m_early = EventBuilder::group_message(GROUP, "early")
        .unwrap()
        .sign_at(&author, 10)
        .unwrap();
    f.groups.apply(&m_late).unwrap();
    f.groups.apply(&m_early).unwrap();
    let order: Vec<u64> = f
        .groups
        .with_group(GROUP, |g| g.messages().iter().map(|e| e.created_at).collect())
        .unwrap();
    assert_eq!(order, vec![10, 30]);
}

#[tokio::test]
async fn members_changed_is_debounced_and_set_sensitive() {
    let f = fixture();
    let mut events = f.bus.group_events();

    // A burst of adds inside the quiescence window → one notification.
    for ts in 10..15 {
        let member = Keys::generate().public_key_hex();
        f.groups
            .apply(&add_user(&f.admin, &member, &[Role::Member], None, ts))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut changes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, GroupEvent::MembersChanged { .. }) {
            changes += 1;
        }
    }
    assert_eq!(changes, 1, "burst must coalesce into one notification");

    // Re-asserting the same membership must not notify again.
    let members = f.groups.members(GROUP);
    let snapshot = members_snapshot(
        &f.admin,
        &members.iter().map(String::as_str).collect::<Vec<_>>(),
        5, // older than every targeted add, changes nothing
    );
    f.groups.apply(&snapshot).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, GroupEvent::MembersChanged { .. }),
            "set-equal view must be suppressed"
        );
    }
}

// ── Authorization ──────────────────────────────────────────────────────

#[tokio::test]
async fn self_leave_is_always_permitted() {
    let f = fixture();
    let member = Keys::generate();
    let member_pk = member.public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &member_pk, &[Role::Member], None, 10))
        .unwrap();

    let leave = remove_user(&member, &member_pk, 20);
    f.groups
        .authorize_publish(GROUP, &leave, "relay-pubkey")
        .unwrap();

    // Removing someone else without admin is refused.
    let other = Keys::generate().public_key_hex();
    let kick = remove_user(&member, &other, 21);
    assert!(f.groups.authorize_publish(GROUP, &kick, "relay-pubkey").is_err());
}

#[tokio::test]
async fn invites_follow_group_openness() {
    let f = fixture();
    let member = Keys::generate();
    let member_pk = member.public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &member_pk, &[Role::Member], None, 10))
        .unwrap();
    let invite = EventBuilder::invite(GROUP, &Keys::generate().public_key_hex(), "ct?iv=iv")
        .unwrap()
        .sign_at(&member, 20)
        .unwrap();

    // Closed group: member invites are refused.
    assert!(f.groups.authorize_publish(GROUP, &invite, "relay").is_err());

    // Open group: any current member may invite.
    let open = EventBuilder::group_metadata(GROUP, "fixture group", "", true, true)
        .unwrap()
        .sign_at(&f.admin, 30)
        .unwrap();
    f.groups.apply(&open).unwrap();
    f.groups.authorize_publish(GROUP, &invite, "relay").unwrap();
}

#[tokio::test]
async fn non_members_cannot_post_and_members_cannot_moderate() {
    let f = fixture();
    let outsider = Keys::generate();
    let message = EventBuilder::group_message(GROUP, "hi")
        .unwrap()
        .sign_at(&outsider, 10)
        .unwrap();
    assert!(f.groups.authorize_publish(GROUP, &message, "relay").is_err());

    let member = Keys::generate();
    let member_pk = member.public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &member_pk, &[Role::Member], None, 10))
        .unwrap();
    let add = EventBuilder::add_user(GROUP, &outsider.public_key_hex(), &[Role::Member], None)
        .unwrap()
        .sign_at(&member, 20)
        .unwrap();
    assert!(f.groups.authorize_publish(GROUP, &add, "relay").is_err());

    let admin_add = EventBuilder::add_user(GROUP, &outsider.public_key_hex(), &[Role::Member], None)
        .unwrap()
        .sign_at(&f.admin, 21)
        .unwrap();
    f.groups.authorize_publish(GROUP, &admin_add, "relay").unwrap();
}

#[tokio::test]
async fn join_request_from_member_is_refused() {
    let f = fixture();
    let member = Keys::generate();
    let member_pk = member.public_key_hex();
    f.groups
        .apply(&add_user(&f.admin, &member_pk, &[Role::Member], None, 10))
        .unwrap();
    let request = EventBuilder::join_request(GROUP, "again?")
        .unwrap()
        .sign_at(&member, 20)
        .unwrap();
    assert!(f.groups.authorize_publish(GROUP, &request, "relay").is_err());

    let stranger = EventBuilder::join_request(GROUP, "first time")
        .unwrap()
        .sign_at(&Keys::generate(), 21)
        .unwrap();
    f.groups.authorize_publish(GROUP, &stranger, "relay").unwrap();
}
