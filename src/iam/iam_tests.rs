use super::*;
use crate::iam::model::ContainerSpec;

fn open() -> (tempfile::TempDir, Iam) {
    let tmp = tempfile::tempdir().unwrap();
    let store = SharedStore::new(tmp.path()).unwrap();
    (tmp, Iam::open(&store, "space00000", "local.poms.space00000", "finmars"))
}

fn doc(json: serde_json::Value) -> PolicyDocument {
    serde_json::from_value(json).unwrap()
}

fn read_all() -> PolicyDocument {
    doc(serde_json::json!({
        "Version": "2023-01-01",
        "Statement": [{"Effect": "Allow", "Principal": "*", "Action": ["finmars:explorer:read"], "Resource": "frn:finmars:explorer:*"}]
    }))
}

fn policy(code: &str, members: &[&str]) -> PolicySpec {
    PolicySpec {
        user_code: code.into(),
        policy: Some(read_all()),
        members: members.iter().map(|m| m.to_string()).collect(),
        ..PolicySpec::default()
    }
}

fn read_req(iam: &Iam) -> AccessRequest {
    iam.request("explorer", "read", "GET").on(ResourceRef::new("explorer", "space00000/a.txt"))
}

#[test]
fn direct_policy_allows_member() {
    let (_t, iam) = open();
    let alice = iam.directory().ensure_member("alice").unwrap();
    let bob = iam.directory().ensure_member("bob").unwrap();
    assert_ne!(alice.id, bob.id);
    iam.directory().create_policy(policy("p1", &["alice"])).unwrap();
    assert!(iam.evaluate(&alice, &read_req(&iam)).unwrap().allow);
    assert!(!iam.evaluate(&bob, &read_req(&iam)).unwrap().allow);
    assert_eq!(iam.authorize(&bob, &read_req(&iam)).unwrap_err().error_key(), "policy_deny");
}

#[test]
fn role_and_group_policies_are_unioned() {
    let (_t, iam) = open();
    let dir = iam.directory();
    for p in ["direct", "via-role", "via-group", "via-group-role"] {
        dir.create_policy(policy(p, &[])).unwrap();
    }
    dir.add_policy_member("direct", "carol").unwrap();
    dir.create_role(ContainerSpec { user_code: "r1".into(), members: vec!["carol".into()], access_policies: vec!["via-role".into()], ..Default::default() }).unwrap();
    dir.create_role(ContainerSpec { user_code: "r2".into(), access_policies: vec!["via-group-role".into()], ..Default::default() }).unwrap();
    dir.create_group(ContainerSpec {
        user_code: "g1".into(),
        name: Some("Traders".into()),
        members: vec!["carol".into()],
        roles: vec!["r2".into()],
        access_policies: vec!["via-group".into(), "direct".into()],
        ..Default::default()
    })
    .unwrap();
    let mut codes = dir.effective_policy_codes("carol");
    codes.sort();
    assert_eq!(codes, vec!["direct", "via-group", "via-group-role", "via-role"]);

    let carol = dir.ensure_member("carol").unwrap();
    let subject = dir.subject(&carol);
    assert!(subject.in_group("Traders"));
    assert!(subject.in_group("g1"));
}

#[test]
fn cache_is_invalidated_by_directory_writes() {
    let (_t, iam) = open();
    let dir = iam.directory();
    let dave = dir.ensure_member("dave").unwrap();
    dir.create_policy(policy("p", &[])).unwrap();
    dir.create_role(ContainerSpec { user_code: "readers".into(), members: vec!["dave".into()], access_policies: vec!["p".into()], ..Default::default() }).unwrap();

    assert!(iam.evaluate(&dave, &read_req(&iam)).unwrap().allow);
    assert!(iam.evaluate(&dave, &read_req(&iam)).unwrap().allow);
    let (hits, _) = iam.cache().stats();
    assert!(hits >= 1);

    dir.update_role("readers", ContainerSpec { user_code: "readers".into(), access_policies: vec!["p".into()], ..Default::default() }).unwrap();
    assert!(!iam.evaluate(&dave, &read_req(&iam)).unwrap().allow);

    dir.update_role("readers", ContainerSpec { user_code: "readers".into(), members: vec!["dave".into()], access_policies: vec!["p".into()], ..Default::default() }).unwrap();
    assert!(iam.evaluate(&dave, &read_req(&iam)).unwrap().allow);

    // Changing the document reaches members holding it through the role
    let deny = doc(serde_json::json!({
        "Statement": [{"Effect": "Deny", "Principal": "*", "Action": "finmars:explorer:*"}]
    }));
    dir.update_policy("p", PolicySpec { user_code: "p".into(), policy: Some(deny), ..PolicySpec::default() }).unwrap();
    let d = iam.evaluate(&dave, &read_req(&iam)).unwrap();
    assert!(!d.allow);
    assert_eq!(d.reason.as_deref(), Some("denied_by:p"));
}

#[test]
fn malformed_policy_is_rejected_on_write() {
    let (_t, iam) = open();
    let bad = doc(serde_json::json!({
        "Statement": [{"Effect": "Allow", "Principal": "*", "Action": "read"}]
    }));
    let err = iam.directory().create_policy(PolicySpec { user_code: "bad".into(), policy: Some(bad), ..PolicySpec::default() }).unwrap_err();
    assert_eq!(err.error_key(), "policy_parse_error");
    assert!(iam.directory().get_policy("bad").unwrap().is_none());
    assert_eq!(iam.directory().create_policy(PolicySpec { user_code: "x".into(), ..PolicySpec::default() }).unwrap_err().error_key(), "validation_error");
}

#[test]
fn deleting_policy_prunes_containers() {
    let (_t, iam) = open();
    let dir = iam.directory();
    dir.create_policy(policy("p", &["erin"])).unwrap();
    dir.create_role(ContainerSpec { user_code: "r".into(), access_policies: vec!["p".into()], ..Default::default() }).unwrap();
    let erin = dir.ensure_member("erin").unwrap();
    assert!(iam.evaluate(&erin, &read_req(&iam)).unwrap().allow);
    dir.delete_policy("p").unwrap();
    assert!(dir.get_role("r").unwrap().unwrap().access_policies.is_empty());
    assert!(!iam.evaluate(&erin, &read_req(&iam)).unwrap().allow);
    assert!(dir.delete_policy("p").unwrap_err().is_not_found());
    let err = dir.create_role(ContainerSpec { user_code: "r2".into(), access_policies: vec!["ghost".into()], ..Default::default() }).unwrap_err();
    assert_eq!(err.error_key(), "validation_error");
}

#[test]
fn admins_bypass_and_anonymous_has_nothing() {
    let (_t, iam) = open();
    let root = iam.directory().upsert_member(MemberSpec { username: "root".into(), is_admin: true, ..MemberSpec::default() }).unwrap();
    assert_eq!(iam.evaluate(&root, &read_req(&iam)).unwrap(), Decision::allow("admin"));
    assert!(!iam.evaluate(&Member::anonymous(), &read_req(&iam)).unwrap().allow);
}

#[test]
fn filter_permitted_expands_resource_groups() {
    let (_t, iam) = open();
    let dir = iam.directory();
    dir.create_policy(PolicySpec {
        user_code: "finance-objects".into(),
        policy: Some(doc(serde_json::json!({
            "Statement": [{
                "Effect": "Allow", "Principal": "authenticated",
                "Action": "finmars:storageobject:<safe_methods>",
                "Resource": ["frn:finmars:iam:resourcegroup:finance", "frn:finmars:explorer:storageobject:space00000/public/*"]
            }]
        }))),
        members: vec!["frank".into()],
        ..PolicySpec::default()
    })
    .unwrap();
    let frank = dir.ensure_member("frank").unwrap();
    let items = vec![
        ("space00000/q1.csv", vec!["finance".to_string()]),
        ("space00000/hr.csv", vec![]),
        ("space00000/public/readme.md", vec![]),
    ];
    let req = iam.request("storageobject", "list", "GET");
    let kept = iam
        .filter_permitted(&frank, &req, items, |(p, g)| ResourceRef::new("explorer:storageobject", *p).with_groups(g.clone()))
        .unwrap();
    let names: Vec<&str> = kept.iter().map(|(p, _)| *p).collect();
    assert_eq!(names, vec!["space00000/q1.csv", "space00000/public/readme.md"]);
}

#[test]
fn deleting_member_removes_memberships() {
    let (_t, iam) = open();
    let dir = iam.directory();
    dir.create_policy(policy("p", &["gina"])).unwrap();
    dir.create_group(ContainerSpec { user_code: "g".into(), members: vec!["gina".into()], ..Default::default() }).unwrap();
    dir.ensure_member("gina").unwrap();
    dir.delete_member("gina").unwrap();
    assert!(dir.require_policy("p").unwrap().members.is_empty());
    assert!(dir.get_group("g").unwrap().unwrap().members.is_empty());
    assert!(dir.get_member("gina").unwrap().is_none());
}

#[test]
fn recreated_policy_is_recompiled() {
    let (_t, iam) = open();
    let dir = iam.directory();
    let eve = dir.ensure_member("eve").unwrap();
    dir.create_policy(policy("p", &["eve"])).unwrap();
    assert!(iam.evaluate(&eve, &read_req(&iam)).unwrap().allow);

    dir.delete_policy("p").unwrap();
    let deny = doc(serde_json::json!({
        "Version": "2023-01-01",
        "Statement": [{"Effect": "Deny", "Principal": "*", "Action": ["finmars:explorer:read"], "Resource": "frn:finmars:explorer:*"}]
    }));
    let recreated = dir
        .create_policy(PolicySpec { user_code: "p".into(), policy: Some(deny), members: vec!["eve".into()], ..PolicySpec::default() })
        .unwrap();
    assert!(recreated.revision > 1);
    let d = iam.evaluate(&eve, &read_req(&iam)).unwrap();
    assert!(!d.allow, "{:?}", d);
}

#[test]
fn unknown_condition_is_reported_even_when_short_circuited() {
    let (_t, iam) = open();
    let dir = iam.directory();
    let ann = dir.ensure_member("ann").unwrap();
    let guarded = doc(serde_json::json!({
        "Version": "2023-01-01",
        "Statement": [{
            "Effect": "Allow",
            "Principal": "*",
            "Action": ["finmars:explorer:read"],
            "Resource": "frn:finmars:explorer:*",
            "ConditionExpression": "is_authenticated or is_wizard"
        }]
    }));
    dir.create_policy(PolicySpec { user_code: "g".into(), policy: Some(guarded), members: vec!["ann".into()], ..PolicySpec::default() })
        .unwrap();
    let err = iam.evaluate(&ann, &read_req(&iam)).unwrap_err();
    assert_eq!(err.error_key(), "policy_unknown_condition");
    assert!(err.message().contains("is_wizard"));
}
