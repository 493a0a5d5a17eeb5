//! Dispatch tests
//!
//! Build a server image in-process, set up the test thread as a worker and
//! drive requests through the protocol state machines:
//! - Pushing and resuming sections directly
//! - EAP-AKA steps with and without policy
//! - RADIUS authentication through the `users` module
//! - `call` between virtual servers
//! - Compile-time rejection of bad policy

mod common;

use aaa_proto::{AssignOp, ConfigSection, RCode};
use aaa_server::compile::CompileError;
use aaa_server::namespace::NamespaceError;
use aaa_server::{Config, DispatchError, LifecycleError, PushResult, SectionRef, VirtualServers};
use common::{config, context, tally_module, tally_stats, request, server, users_module};

fn build(config: &Config) -> VirtualServers {
    let mut image = VirtualServers::bootstrap(context(), config).unwrap();
    image.instantiate().unwrap();
    image.thread_instantiate().unwrap();
    image
}

fn compile_error(config: &Config) -> CompileError {
    let mut image = VirtualServers::bootstrap(context(), config).unwrap();
    match image.instantiate() {
        Err(LifecycleError::Compile { source, .. }) => source,
        other => panic!("expected a compile error, got {:?}", other.err()),
    }
}

fn radius_config() -> Config {
    config(
        vec![users_module()],
        vec![server(
            "default",
            "radius",
            vec![
                ConfigSection::new("recv", Some("Access-Request")).with_word("users"),
                ConfigSection::new("authenticate", Some("users")).with_word("users"),
                ConfigSection::new("send", Some("Access-Reject")).with_pair(
                    "&reply.Reply-Message",
                    AssignOp::Default,
                    "Access denied",
                ),
            ],
        )],
    )
}

#[tokio::test]
async fn test_push_and_resume() {
    let tag = "dispatch-push";
    let image = build(&config(
        vec![tally_module("tally", serde_json::json!({ "tag": tag }))],
        vec![server(
            "aka",
            "eap-aka",
            vec![
                ConfigSection::new("recv", Some("Identity-Response")).with_word("tally"),
                ConfigSection::new("send", Some("Identity-Request")).with_word("tally"),
            ],
        )],
    ));
    let aka = image.server("aka").unwrap();
    let dispatcher = image.dispatcher();
    let (client_error, _) = aka.registry().lookup("recv", Some("Client-Error")).unwrap();
    let (identity, _) = aka.registry().lookup("recv", Some("Identity-Response")).unwrap();

    // No policy: the section's default result, nothing pushed
    let mut req = request("aka", &[("Subtype", "Client-Error")]);
    let pushed = dispatcher.push(&mut req, aka, &SectionRef::fixed(client_error), true);
    assert_eq!(pushed, PushResult::Done(RCode::Reject));
    assert_eq!(req.stack_depth(), 0);
    assert_eq!(tally_stats(tag).calls(), 0);

    // Policy: pushed, and only run by resume
    let mut req = request("aka", &[("Subtype", "Identity"), ("Identity", "0001")]);
    let pushed = dispatcher.push(&mut req, aka, &SectionRef::fixed(identity), true);
    assert_eq!(pushed, PushResult::PushedChild);
    assert_eq!(req.stack_depth(), 1);
    assert_eq!(tally_stats(tag).calls(), 0);

    assert_eq!(dispatcher.resume(&mut req).await, RCode::Ok);
    assert_eq!(req.stack_depth(), 0);
    assert_eq!(req.rcode, Some(RCode::Ok));
    assert_eq!(tally_stats(tag).calls(), 1);
    assert_eq!(req.reply.get("Reply-Message"), Some("tally tally"));
}

#[tokio::test]
async fn test_aka_client_error_defaults_to_reject() {
    let image = build(&config(vec![], vec![server("aka", "eap-aka", vec![])]));

    let mut req = request("aka", &[("Subtype", "Client-Error"), ("Client-Error-Code", "0")]);
    let rcode = image.process(&mut req).await.unwrap();

    assert_eq!(rcode, RCode::Reject);
    assert_eq!(req.reply.get("EAP-Code"), Some("Failure"));
    assert!(!req.reply.contains("Subtype"));
    assert_eq!(image.stats().count("aka", "recv Client-Error", RCode::Reject), 1);
    // Failure path runs its cleanup sections without policy
    assert_eq!(image.stats().count("aka", "clear session", RCode::Noop), 1);
}

#[tokio::test]
async fn test_aka_identity_response_runs_policy() {
    let image = build(&config(
        vec![],
        vec![server(
            "aka",
            "eap-aka",
            vec![ConfigSection::new("recv", Some("Identity-Response")).with_section(
                ConfigSection::new("if", Some("&Identity !~ /^[024]/")).with_word("reject"),
            )],
        )],
    ));

    let mut bad = request("aka", &[("Subtype", "Identity"), ("Identity", "bob@example.org")]);
    assert_eq!(image.process(&mut bad).await.unwrap(), RCode::Handled);
    assert_eq!(bad.reply.get("Subtype"), Some("Notification"));
    assert_eq!(bad.reply.get("Notification"), Some("Failure"));
    assert_eq!(image.stats().count("aka", "recv Identity-Response", RCode::Reject), 1);

    let mut good = request("aka", &[("Subtype", "Identity"), ("Identity", "0123456789012345")]);
    assert_eq!(image.process(&mut good).await.unwrap(), RCode::Handled);
    assert_eq!(good.reply.get("Subtype"), Some("Challenge"));
    assert_eq!(good.control.get("Permanent-Identity"), Some("123456789012345"));
}

#[tokio::test]
async fn test_aka_identity_request_setting() {
    let mut cfg = config(vec![], vec![server("aka", "eap-aka", vec![])]);
    cfg.servers[0].settings = serde_json::json!({ "request_identity": "permanent" });
    let image = build(&cfg);

    // A pseudonym is not good enough; ask for the permanent identity
    let mut req = request("aka", &[("Identity", "2pseudonym")]);
    assert_eq!(image.process(&mut req).await.unwrap(), RCode::Handled);
    assert_eq!(req.reply.get("Subtype"), Some("AKA-Identity"));
    assert_eq!(req.reply.get("Identity-Request-Type"), Some("permanent"));

    // No identity at all starts the conversation
    let mut start = request("aka", &[]);
    assert_eq!(image.process(&mut start).await.unwrap(), RCode::Handled);
    assert_eq!(start.reply.get("Subtype"), Some("Identity"));
}

#[tokio::test]
async fn test_aka_challenge_response_issues_identities() {
    let tag = "dispatch-aka-store";
    let image = build(&config(
        vec![tally_module("sessions", serde_json::json!({ "tag": tag }))],
        vec![server(
            "aka",
            "eap-aka",
            vec![
                ConfigSection::new("store", Some("session")).with_word("sessions"),
                ConfigSection::new("store", Some("pseudonym")).with_word("sessions"),
            ],
        )],
    ));

    let mut req = request("aka", &[("Subtype", "Challenge"), ("Identity", "0123")]);
    assert_eq!(image.process(&mut req).await.unwrap(), RCode::Ok);
    assert_eq!(req.reply.get("EAP-Code"), Some("Success"));

    let pseudonym = req.reply.get("Next-Pseudonym").unwrap();
    let reauth = req.reply.get("Next-Reauth-Id").unwrap();
    assert_eq!(pseudonym.len(), 14);
    assert!(pseudonym.starts_with('2'));
    assert!(reauth.starts_with('4'));
    assert_eq!(tally_stats(tag).calls(), 2);
}

#[tokio::test]
async fn test_aka_unknown_subtype() {
    let image = build(&config(vec![], vec![server("aka", "eap-aka", vec![])]));
    let mut req = request("aka", &[("Subtype", "Bogus")]);

    let err = image.process(&mut req).await.unwrap_err();
    assert!(matches!(err, DispatchError::Protocol { ref server, .. } if server == "aka"));
    assert_eq!(image.stats().snapshot().errors, 1);
}

#[tokio::test]
async fn test_unknown_server() {
    let image = build(&config(vec![], vec![server("aka", "eap-aka", vec![])]));
    let mut req = request("nosuch", &[]);

    assert_eq!(
        image.process(&mut req).await,
        Err(DispatchError::UnknownServer("nosuch".to_string()))
    );
}

#[tokio::test]
async fn test_radius_users_flow() {
    let image = build(&radius_config());

    let mut accept = request("default", &[("User-Name", "alice"), ("User-Password", "wonderland")]);
    assert_eq!(image.process(&mut accept).await.unwrap(), RCode::Ok);
    assert_eq!(accept.reply.get("Packet-Type"), Some("Access-Accept"));
    assert_eq!(accept.reply.get("Reply-Message"), Some("Hello, alice"));
    assert_eq!(accept.control.get("Auth-Type"), Some("users"));

    let mut wrong = request("default", &[("User-Name", "alice"), ("User-Password", "nope")]);
    assert_eq!(image.process(&mut wrong).await.unwrap(), RCode::Reject);
    assert_eq!(wrong.reply.get("Packet-Type"), Some("Access-Reject"));
    assert_eq!(wrong.reply.get("Reply-Message"), Some("Access denied"));

    // No password, so nothing claims the request
    let mut unclaimed = request("default", &[("User-Name", "bob")]);
    assert_eq!(image.process(&mut unclaimed).await.unwrap(), RCode::Reject);
    assert!(!unclaimed.control.contains("Auth-Type"));

    let stats = image.stats();
    assert_eq!(stats.count("default", "authenticate users", RCode::Ok), 1);
    assert_eq!(stats.count("default", "authenticate users", RCode::Reject), 1);
}

#[tokio::test]
async fn test_radius_missing_authenticate_section() {
    let image = build(&config(
        vec![],
        vec![server(
            "default",
            "radius",
            vec![ConfigSection::new("recv", Some("Access-Request")).with_pair(
                "&control.Auth-Type",
                AssignOp::Set,
                "ldap",
            )],
        )],
    ));

    let mut req = request("default", &[("User-Name", "carol")]);
    assert_eq!(image.process(&mut req).await.unwrap(), RCode::Reject);
    assert_eq!(req.reply.get("Packet-Type"), Some("Access-Reject"));
    assert!(req
        .control
        .get("Module-Failure-Message")
        .unwrap()
        .contains("authenticate ldap"));
}

#[tokio::test]
async fn test_call_runs_sub_request() {
    let image = build(&config(
        vec![],
        vec![
            server(
                "default",
                "radius",
                vec![ConfigSection::new("recv", Some("Access-Request"))
                    .with_section(ConfigSection::new("call", Some("inner")))],
            ),
            server(
                "inner",
                "radius",
                vec![ConfigSection::new("recv", Some("Access-Request"))
                    .with_pair("&control.Auth-Type", AssignOp::Set, "Accept")
                    .with_pair("&reply.Reply-Message", AssignOp::Add, "from inner")],
            ),
        ],
    ));

    let mut req = request("default", &[("User-Name", "dave")]);
    assert_eq!(image.process(&mut req).await.unwrap(), RCode::Ok);
    assert_eq!(req.reply.get("Packet-Type"), Some("Access-Accept"));
    assert_eq!(req.reply.get("Reply-Message"), Some("from inner"));
    assert_eq!(req.depth(), 0);
    assert_eq!(req.stack_depth(), 0);
}

#[test]
fn test_call_namespace_mismatch() {
    let err = compile_error(&config(
        vec![],
        vec![
            server(
                "default",
                "radius",
                vec![ConfigSection::new("recv", Some("Access-Request"))
                    .with_section(ConfigSection::new("call", Some("aka")))],
            ),
            server("aka", "eap-aka", vec![]),
        ],
    ));

    match err {
        CompileError::Namespace(NamespaceError::NamespaceMismatch {
            server,
            expected,
            actual,
            ..
        }) => {
            assert_eq!(server, "aka");
            assert_eq!(expected, "radius");
            assert_eq!(actual, "eap-aka");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_call_unknown_server() {
    let err = compile_error(&config(
        vec![],
        vec![server(
            "default",
            "radius",
            vec![ConfigSection::new("recv", Some("Access-Request"))
                .with_section(ConfigSection::new("call", Some("missing")))],
        )],
    ));
    assert!(matches!(err, CompileError::Namespace(NamespaceError::UnknownServer { .. })));
}

#[test]
fn test_method_not_permitted() {
    let tally = || tally_module("tally", serde_json::json!({ "tag": "dispatch-permitted" }));

    // Session storage methods belong to the session sections only
    let err = compile_error(&config(
        vec![tally()],
        vec![server(
            "aka",
            "eap-aka",
            vec![ConfigSection::new("recv", Some("Identity-Response")).with_word("tally.store.session")],
        )],
    ));
    assert!(matches!(err, CompileError::MethodNotPermitted { ref call, .. } if call == "tally.store.session"));

    let err = compile_error(&config(
        vec![tally()],
        vec![server(
            "aka",
            "eap-aka",
            vec![ConfigSection::new("load", Some("session")).with_word("tally.store.session")],
        )],
    ));
    assert!(matches!(err, CompileError::MethodNotPermitted { .. }));

    // The section's own method is fine
    let mut image = VirtualServers::bootstrap(
        context(),
        &config(
            vec![tally()],
            vec![server(
                "aka",
                "eap-aka",
                vec![ConfigSection::new("store", Some("session")).with_word("tally.store.session")],
            )],
        ),
    )
    .unwrap();
    assert!(image.instantiate().is_ok());
}

#[test]
fn test_duplicate_section_rejected() {
    let err = compile_error(&config(
        vec![],
        vec![server(
            "aka",
            "eap-aka",
            vec![
                ConfigSection::new("recv", Some("Identity-Response")).with_word("ok"),
                ConfigSection::new("recv", Some("Identity-Response")).with_word("reject"),
            ],
        )],
    ));
    assert!(matches!(err, CompileError::InvalidSection { ref reason, .. } if reason.contains("duplicate")));
}

#[test]
fn test_unknown_section_rejected() {
    let err = compile_error(&config(
        vec![],
        vec![server(
            "aka",
            "eap-aka",
            vec![ConfigSection::new("recv", Some("Access-Request")).with_word("ok")],
        )],
    ));
    assert!(matches!(err, CompileError::UnknownSection { ref protocol, .. } if protocol == "eap_aka"));
}

#[tokio::test]
async fn test_compiled_section_outlives_free() {
    let image = build(&config(
        vec![],
        vec![server(
            "aka",
            "eap-aka",
            vec![ConfigSection::new("recv", Some("Identity-Response")).with_word("ok")],
        )],
    ));

    let aka = image.server("aka").unwrap().clone();
    let (id, _) = aka.registry().lookup("recv", Some("Identity-Response")).unwrap();
    let entry = SectionRef::fixed(id);

    let held = aka.compiled_section(&entry).unwrap();
    let again = aka.compiled_section(&entry).unwrap();
    assert!(std::sync::Arc::ptr_eq(&held, &again));
    drop(again);

    image.thread_detach();
    image.free();
    assert!(aka.compiled_section(&entry).is_none());
    assert_eq!(held.display_name(), "recv Identity-Response");
    assert_eq!(std::sync::Arc::strong_count(&held), 1);

    let mut req = request("aka", &[("Subtype", "Identity")]);
    assert_eq!(image.process(&mut req).await, Err(DispatchError::NotRunning));
}
