use std::sync::Arc;

use bytes::Bytes;
use http::{Request, StatusCode};

use super::*;
use crate::{
    dispatch::DispatchOutcome,
    element::{ElementKind, ElementModel},
    engine::testing::RecordingEngine,
    http::{Filter, FilterChain, Servlet, WebRequest, WebResponse},
    resolver::ArbitrationPolicy,
    ServletError, ValidationError,
};

struct Tagged(String);

impl Servlet for Tagged {
    fn service(&self, _req: &mut WebRequest, resp: &mut WebResponse) -> Result<(), ServletError> {
        resp.write(self.0.as_bytes());
        Ok(())
    }
}

struct Mark(&'static str);

impl Filter for Mark {
    fn do_filter(
        &self,
        req: &mut WebRequest,
        resp: &mut WebResponse,
        chain: FilterChain<'_>,
    ) -> Result<(), ServletError> {
        resp.write(self.0.as_bytes());
        chain.proceed(req, resp)
    }
}

fn server(policy: ArbitrationPolicy) -> (WebServer, Arc<RecordingEngine>) {
    let engine = Arc::new(RecordingEngine::default());
    let config = ServerConfig {
        arbitration: policy,
        ..Default::default()
    };
    let server = WebServer::new(config, engine.clone(), Arc::new(ClassRegistry::default()));
    server.start().unwrap();
    (server, engine)
}

fn add_contexts(server: &WebServer, contexts: &[(&str, &str)]) {
    let mut batch = server.begin_batch("contexts");
    for (id, path) in contexts {
        batch.add(Change::AddLogicalContext(
            LogicalContext::new(*id, path).unwrap(),
        ));
    }
    server.submit(batch).unwrap();
}

fn servlet(name: &str, service_id: u64, rank: i32, targets: &[&str]) -> ElementModel {
    let mut builder = ElementModel::builder(ElementKind::Servlet)
        .name(name)
        .servlet(Arc::new(Tagged(format!("{name}:{service_id}"))))
        .url_pattern("/s")
        .service_id(service_id)
        .rank(rank);
    for target in targets {
        builder = builder.target_context(*target);
    }
    builder.build().unwrap()
}

fn filter(name: &'static str, service_id: u64, rank: i32, target: &str) -> ElementModel {
    ElementModel::builder(ElementKind::Filter)
        .name(name)
        .filter(Arc::new(Mark(name)))
        .url_pattern("/*")
        .service_id(service_id)
        .rank(rank)
        .target_context(target)
        .build()
        .unwrap()
}

fn add(server: &WebServer, element: ElementModel) -> ElementId {
    let id = element.id();
    server
        .submit(Batch::new("add").with(Change::add_element(element)))
        .unwrap();
    id
}

fn remove(server: &WebServer, id: ElementId) {
    server
        .submit(Batch::new("remove").with(Change::RemoveElement(id)))
        .unwrap();
}

fn get(server: &WebServer, path: &str) -> Dispatched {
    let request = Request::get(path).body(Bytes::new()).unwrap();
    server.dispatch(request).unwrap()
}

fn body(dispatched: &Dispatched) -> &str {
    std::str::from_utf8(dispatched.response.body()).unwrap()
}

fn filter_names(server: &WebServer, path: &str) -> Vec<String> {
    server
        .request_info(path)
        .filters
        .into_iter()
        .map(|f| f.name)
        .collect()
}

fn paths(paths: &[&str]) -> Vec<ContextPath> {
    paths.iter().map(|p| ContextPath::parse(p).unwrap()).collect()
}

#[test]
fn test_scenario_a_contexts_hold_separate_winners() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1"), ("c2", "/c2"), ("c3", "/c3")]);
    add(&server, servlet("s1", 1, 0, &["c1", "c2"]));
    add(&server, servlet("s1", 2, 3, &["c3"]));

    assert_eq!("s1:1", body(&get(&server, "/c1/s")));
    assert_eq!("s1:1", body(&get(&server, "/c2/s")));
    assert_eq!("s1:2", body(&get(&server, "/c3/s")));

    let missing = get(&server, "/c4/s");
    assert_eq!(DispatchOutcome::NotFound, missing.outcome);
    assert_eq!(StatusCode::NOT_FOUND, missing.response.status());
}

#[test]
fn test_scenario_b_filter_order_follows_rank() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    add(&server, servlet("s", 1, 0, &["c1"]));
    let f1 = add(&server, filter("f1", 2, 10, "c1"));
    let f2 = add(&server, filter("f2", 3, 15, "c1"));

    assert_eq!(vec!["f2", "f1"], filter_names(&server, "/c1/s"));
    assert_eq!("f2f1s:1", body(&get(&server, "/c1/s")));

    remove(&server, f2);
    assert_eq!(vec!["f1"], filter_names(&server, "/c1/s"));
    assert_eq!("f1s:1", body(&get(&server, "/c1/s")));

    remove(&server, f1);
    assert!(filter_names(&server, "/c1/s").is_empty());
    let dispatched = get(&server, "/c1/s");
    assert_eq!(DispatchOutcome::Serviced, dispatched.outcome);
    assert_eq!("s:1", body(&dispatched));
}

#[test]
fn test_scenario_c_strict_cascade() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1"), ("c2", "/c2"), ("c4", "/c4")]);
    let id1 = add(&server, servlet("s1", 1, 0, &["c1", "c2"]));
    let id3 = add(&server, servlet("s1", 3, 0, &["c1"]));

    assert_eq!(paths(&["/c1", "/c2"]), server.enabled_in(id1));
    assert!(!server.is_enabled(id3));

    let id5 = add(&server, servlet("s1", 5, 1, &["c2", "c4"]));
    assert_eq!(paths(&["/c2", "/c4"]), server.enabled_in(id5));
    assert!(!server.is_enabled(id1));
    assert_eq!(paths(&["/c1"]), server.enabled_in(id3));

    assert_eq!("s1:3", body(&get(&server, "/c1/s")));
    assert_eq!("s1:5", body(&get(&server, "/c2/s")));
    assert_eq!("s1:5", body(&get(&server, "/c4/s")));

    // and back once the outranking element leaves
    remove(&server, id5);
    assert_eq!(paths(&["/c1", "/c2"]), server.enabled_in(id1));
    assert!(!server.is_enabled(id3));
}

#[test]
fn test_single_winner_per_name() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let ids: Vec<ElementId> = (1..=4)
        .map(|service_id| add(&server, servlet("same", service_id, 0, &["c1"])))
        .collect();
    let enabled: Vec<&ElementId> = ids.iter().filter(|id| server.is_enabled(**id)).collect();
    assert_eq!(1, enabled.len());

    let snapshot = server.model_snapshot();
    let shadowed = snapshot
        .elements
        .iter()
        .filter(|e| e.name == "same" && !e.shadowed_in.is_empty())
        .count();
    assert_eq!(3, shadowed);
}

#[test]
fn test_dynamic_registration_wins() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let declarative = add(&server, servlet("s", 1, 100, &["c1"]));
    let dynamic = ElementModel::builder(ElementKind::Servlet)
        .name("s")
        .servlet(Arc::new(Tagged("dynamic".into())))
        .url_pattern("/s")
        .service_id(9)
        .dynamic(true)
        .target_context("c1")
        .build()
        .unwrap();
    let dynamic = add(&server, dynamic);

    assert!(server.is_enabled(dynamic));
    assert!(!server.is_enabled(declarative));
    assert_eq!("dynamic", body(&get(&server, "/c1/s")));
}

#[test]
fn test_rank_then_age_tie_break() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let young = add(&server, servlet("s", 7, 2, &["c1"]));
    let old = add(&server, servlet("s", 3, 2, &["c1"]));
    let low = add(&server, servlet("s", 1, 1, &["c1"]));

    assert!(server.is_enabled(old));
    assert!(!server.is_enabled(young));
    assert!(!server.is_enabled(low));
}

#[test]
fn test_promotion_on_removal() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let best = add(&server, servlet("s", 1, 5, &["c1"]));
    let next = add(&server, servlet("s", 2, 3, &["c1"]));
    let last = add(&server, servlet("s", 3, 0, &["c1"]));

    remove(&server, best);
    assert!(server.is_enabled(next));
    assert!(!server.is_enabled(last));

    remove(&server, next);
    assert!(server.is_enabled(last));

    remove(&server, last);
    let missing = get(&server, "/c1/s");
    assert_eq!(DispatchOutcome::NotFound, missing.outcome);
}

#[test]
fn test_per_context_arbitration_is_independent() {
    let (server, _) = server(ArbitrationPolicy::PerContext);
    add_contexts(&server, &[("c1", "/c1"), ("c2", "/c2")]);
    let both = add(&server, servlet("s", 1, 0, &["c1", "c2"]));
    let strong = add(&server, servlet("s", 2, 10, &["c2"]));

    assert_eq!(paths(&["/c1"]), server.enabled_in(both));
    assert_eq!(paths(&["/c2"]), server.enabled_in(strong));
    assert_eq!("s:1", body(&get(&server, "/c1/s")));
    assert_eq!("s:2", body(&get(&server, "/c2/s")));

    let snapshot = server.model_snapshot();
    assert_eq!(paths(&["/c2"]), snapshot.element(both).unwrap().shadowed_in);
}

#[test]
fn test_filter_scoped_to_target_context() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    let a = LogicalContext::new("a", "/app").unwrap();
    let b = LogicalContext::new("b", "/app").unwrap().with_rank(5);
    server
        .submit(
            Batch::new("contexts")
                .with(Change::AddLogicalContext(a))
                .with(Change::AddLogicalContext(b)),
        )
        .unwrap();
    add(&server, servlet("s", 1, 0, &["a"]));
    add(&server, filter("only-a", 2, 0, "a"));

    // /s resolves to the servlet's context a, anything else to the top context b
    let info = server.request_info("/app/s");
    assert_eq!(Some("a".to_string()), info.context);
    assert_eq!(vec!["only-a"], filter_names(&server, "/app/s"));

    let info = server.request_info("/app/other");
    assert_eq!(Some("b".to_string()), info.context);
    assert!(info.filters.is_empty());
}

#[test]
fn test_failed_validation_leaves_model_untouched() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let before = server.model_snapshot();
    let batches = engine.batches.lock().len();

    let batch = Batch::new("broken")
        .with(Change::AddLogicalContext(
            LogicalContext::new("c2", "/c2").unwrap(),
        ))
        .with(Change::add_element(servlet("s", 1, 0, &["c2"])))
        .with(Change::RemoveElement(ElementId::from(u64::MAX)));
    let err = server.submit(batch).unwrap_err();

    match &err {
        BatchError::Validation { label, index, .. } => {
            assert_eq!("broken", label);
            assert_eq!(2, *index);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        Some(&ValidationError::UnknownElement(ElementId::from(u64::MAX))),
        err.validation_error()
    );
    let after = server.model_snapshot();
    assert_eq!(before.fingerprint, after.fingerprint);
    assert_eq!(before, after);
    assert_eq!(batches, engine.batches.lock().len());
}

#[test]
fn test_operations_validate_in_order() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    // the element references a context added later in the same batch
    let batch = Batch::new("misordered")
        .with(Change::add_element(servlet("s", 1, 0, &["late"])))
        .with(Change::AddLogicalContext(
            LogicalContext::new("late", "/late").unwrap(),
        ));
    let err = server.submit(batch).unwrap_err();
    assert_eq!(
        Some(&ValidationError::UnknownContext("late".into())),
        err.validation_error()
    );

    let batch = Batch::new("ordered")
        .with(Change::AddLogicalContext(
            LogicalContext::new("late", "/late").unwrap(),
        ))
        .with(Change::add_element(servlet("s", 1, 0, &["late"])));
    server.submit(batch).unwrap();
    assert_eq!("s:1", body(&get(&server, "/late/s")));
}

#[test]
fn test_engine_rejection_rolls_back() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let first = add(&server, servlet("s", 1, 0, &["c1"]));
    let before = server.model_snapshot();

    engine.set_fail(true);
    let challenger = servlet("s", 2, 10, &["c1"]);
    let challenger_id = challenger.id();
    let err = server
        .submit(Batch::new("rejected").with(Change::add_element(challenger.clone())))
        .unwrap_err();
    assert!(matches!(err, BatchError::Engine { .. }));
    assert_eq!(before, server.model_snapshot());
    assert!(server.is_enabled(first));
    assert_eq!("s:1", body(&get(&server, "/c1/s")));

    // no implicit retry, the caller resubmits
    engine.set_fail(false);
    server
        .submit(Batch::new("retry").with(Change::add_element(challenger)))
        .unwrap();
    assert!(server.is_enabled(challenger_id));
    assert_eq!("s:2", body(&get(&server, "/c1/s")));
}

#[test]
fn test_minimal_effects() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let effects = engine.last_batch();
    assert!(effects.contains(&"create /c1".to_string()));
    assert!(effects.contains(&"bind c1 to /c1".to_string()));

    let first = servlet("s", 1, 0, &["c1"]);
    let first_label = first.to_string();
    add(&server, first);
    assert_eq!(vec![format!("activate {first_label} in /c1")], engine.last_batch());

    // a shadowed registration changes nothing the engine can see
    let batches = engine.batches.lock().len();
    add(&server, servlet("s", 2, 0, &["c1"]));
    assert_eq!(batches, engine.batches.lock().len());

    let better = servlet("s", 3, 5, &["c1"]);
    let better_label = better.to_string();
    add(&server, better);
    assert_eq!(
        vec![
            format!("deactivate {first_label} in /c1"),
            format!("activate {better_label} in /c1"),
        ],
        engine.last_batch()
    );
}

#[test]
fn test_context_lifecycle_effects() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let id = add(&server, servlet("s", 1, 0, &["c1"]));

    server
        .submit(Batch::new("drop").with(Change::RemoveLogicalContext("c1".into())))
        .unwrap();
    let effects = engine.last_batch();
    assert!(effects[0].starts_with("deactivate"));
    assert!(effects.contains(&"unbind c1 from /c1".to_string()));
    assert!(effects.contains(&"destroy /c1".to_string()));
    assert!(!server.is_enabled(id));
    assert_eq!(DispatchOutcome::NotFound, get(&server, "/c1/s").outcome);
}

#[test]
fn test_removed_target_falls_back_to_shared_path() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    let a = LogicalContext::new("a", "/app").unwrap();
    let b = LogicalContext::new("b", "/app").unwrap().with_rank(5);
    server
        .submit(
            Batch::new("contexts")
                .with(Change::AddLogicalContext(a))
                .with(Change::AddLogicalContext(b)),
        )
        .unwrap();
    let id = add(&server, servlet("s", 1, 0, &["a"]));
    assert_eq!("s:1", body(&get(&server, "/app/s")));

    server
        .submit(Batch::new("drop a").with(Change::RemoveLogicalContext("a".into())))
        .unwrap();
    assert!(server.is_enabled(id));
    assert_eq!(paths(&["/app"]), server.enabled_in(id));
    assert_eq!("s:1", body(&get(&server, "/app/s")));
    assert_eq!(Some("b".to_string()), server.request_info("/app/s").context);

    server
        .submit(Batch::new("drop b").with(Change::RemoveLogicalContext("b".into())))
        .unwrap();
    assert!(!server.is_enabled(id));
    assert_eq!(DispatchOutcome::NotFound, get(&server, "/app/s").outcome);
}

#[test]
fn test_pinned_physical_context() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    server
        .submit(
            Batch::new("pin")
                .with(Change::add_physical_context("/pinned").unwrap())
                .with(Change::AddLogicalContext(
                    LogicalContext::new("p", "/pinned").unwrap(),
                ))
                .with(Change::RemoveLogicalContext("p".into())),
        )
        .unwrap();
    let snapshot = server.model_snapshot();
    assert!(snapshot
        .physical_contexts
        .iter()
        .any(|p| p.path.as_str() == "/pinned" && p.pinned));

    add_contexts(&server, &[("p", "/pinned")]);
    let err = server
        .submit(Batch::new("unpin").with(Change::RemovePhysicalContext(
            ContextPath::parse("/pinned").unwrap(),
        )))
        .unwrap_err();
    assert!(matches!(
        err.validation_error(),
        Some(ValidationError::PhysicalContextInUse { .. })
    ));
}

#[test]
fn test_rank_change_moves_top_context() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    let a = LogicalContext::new("a", "/app").unwrap().with_rank(1);
    let b = LogicalContext::new("b", "/app").unwrap();
    server
        .submit(
            Batch::new("contexts")
                .with(Change::AddLogicalContext(a))
                .with(Change::AddLogicalContext(b)),
        )
        .unwrap();
    assert_eq!(Some("a".to_string()), server.request_info("/app/x").context);

    server
        .submit(Batch::new("rank").with(Change::UpdateContextRank {
            context: "b".into(),
            rank: 2,
        }))
        .unwrap();
    assert_eq!(Some("b".to_string()), server.request_info("/app/x").context);
}

#[test]
fn test_cascade_converges_within_slot_bound() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    let contexts: Vec<(String, String)> = (0..12)
        .map(|i| (format!("c{i}"), format!("/c{i}")))
        .collect();
    let refs: Vec<(&str, &str)> = contexts
        .iter()
        .map(|(id, path)| (id.as_str(), path.as_str()))
        .collect();
    add_contexts(&server, &refs);

    // element i competes with element i + 1 in context c(i+1), and each is older than the next
    let mut batch = Batch::new("chain");
    for i in 0..11 {
        let first = format!("c{i}");
        let second = format!("c{}", i + 1);
        batch.add(Change::add_element(servlet(
            "chained",
            i as u64 + 10,
            0,
            &[first.as_str(), second.as_str()],
        )));
    }
    server.submit(batch).unwrap();

    // a top-ranked element at the head flips the whole chain
    let head = servlet("chained", 1, 100, &["c0"]);
    let report = server
        .submit(Batch::new("head").with(Change::add_element(head)))
        .unwrap();
    // a name and a pattern slot per context
    let slots = 2 * 12;
    assert!(report.iterations <= slots, "{} > {slots}", report.iterations);

    let snapshot = server.model_snapshot();
    let mut enabled: Vec<u64> = snapshot
        .elements
        .iter()
        .filter(|e| !e.enabled_in.is_empty())
        .map(|e| e.service_id)
        .collect();
    enabled.sort_unstable();
    assert_eq!(vec![1, 11, 13, 15, 17, 19], enabled);
}

#[test]
fn test_stop_withdraws_everything() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    add(&server, servlet("s", 1, 0, &["c1"]));
    server.stop().unwrap();

    let effects = engine.last_batch();
    assert!(effects.iter().any(|e| e.starts_with("deactivate")));
    assert!(effects.contains(&"destroy /c1".to_string()));
    assert!(effects.contains(&"destroy /".to_string()));
    assert!(server.model_snapshot().elements.is_empty());
    assert!(!server.is_started());
}

#[test]
fn test_failed_stop_stays_started() {
    let (server, engine) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    let id = add(&server, servlet("s", 1, 0, &["c1"]));

    engine.set_fail(true);
    assert!(server.stop().is_err());
    assert!(server.is_started());
    assert!(server.is_enabled(id));
    assert_eq!("s:1", body(&get(&server, "/c1/s")));

    engine.set_fail(false);
    server.stop().unwrap();
    assert!(!server.is_started());
    assert!(server.model_snapshot().elements.is_empty());
}

#[test]
fn test_submit_with_reads_committed_model() {
    let (server, _) = server(ArbitrationPolicy::Strict);
    add_contexts(&server, &[("c1", "/c1")]);
    add(&server, servlet("s", 1, 0, &["c1"]));
    add(&server, servlet("t", 2, 0, &["c1"]));

    let report = server
        .submit_with("clear", |model| {
            model
                .elements()
                .map(|state| Change::RemoveElement(state.model().id()))
                .collect()
        })
        .unwrap();
    assert_eq!("clear", report.label);
    assert!(server.model_snapshot().elements.is_empty());
}
