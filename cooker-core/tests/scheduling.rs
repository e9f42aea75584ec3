mod support;

use std::time::{Duration, Instant};

use cooker_core::cook::{
    CookAction, CookEvent, Instigator, ItemState, LeafError, MemoryCacheStore, PlatformResult,
    Urgency,
};
use support::*;

fn run_roots(
    config: cooker_core::cook::CookerConfig,
    provider: &std::sync::Arc<ScriptedProvider>,
    sink: &std::sync::Arc<RecordingSink>,
    roots: &[&str],
) -> (cooker_core::cook::Cooker, cooker_core::cook::CookSummary) {
    let mut cooker = local_cooker(config, provider, sink, Box::new(MemoryCacheStore::new()));
    for root in roots {
        cooker
            .request_item(*root, &[linux()], Urgency::Normal, Instigator::Root)
            .unwrap();
    }
    let summary = cooker.run().unwrap();
    (cooker, summary)
}

#[test]
fn dependency_found_during_save_is_cooked_and_flushed() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("X", Script::default().imports(&["Y"]));

    let (cooker, summary) = run_roots(test_config(), &provider, &sink, &["X"]);

    assert_eq!(cooker.item_state(&id("Y")), Some(ItemState::Idle));
    assert_eq!(cooker.item_result(&id("Y"), &linux()), PlatformResult::Succeeded);
    assert!(cooker.discovered(&id("X"), &linux()).is_empty());
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(sink.count("Y", &linux()), 1);
}

#[test]
fn shared_dependency_is_cooked_once() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("A", Script::default().imports(&["C"]));
    provider.script("B", Script::default().imports(&["C"]));
    provider.script("C", Script::default().imports(&["A"]));

    let (_cooker, summary) = run_roots(test_config(), &provider, &sink, &["A", "B"]);

    assert_eq!(provider.save_count("C"), 1);
    assert_eq!(provider.save_count("A"), 1);
    assert_eq!(summary.succeeded, 3);
}

#[test]
fn collection_lands_between_second_and_third_item() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("slow", Script::default().pending(3));
    let mut config = test_config();
    config.gc.items_per_collection = 2;

    let mut cooker = local_cooker(config, &provider, &sink, Box::new(MemoryCacheStore::new()));
    let mut events = cooker.subscribe();
    for root in ["a", "b", "slow"] {
        cooker
            .request_item(root, &[linux()], Urgency::Normal, Instigator::Root)
            .unwrap();
    }
    let summary = cooker.run().unwrap();

    let mut timeline = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            CookEvent::ItemCompleted { .. } => timeline.push("item"),
            CookEvent::CollectionFinished { .. } => timeline.push("gc"),
            _ => {}
        }
    }
    assert_eq!(timeline, vec!["item", "item", "gc", "item"]);
    assert_eq!(summary.collections, 1);
    assert_eq!(summary.succeeded, 3);
}

#[test]
fn transient_failure_is_retried_once() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "flaky",
        Script::default().failing_save(LeafError::Transient("lock held".into())),
    );

    let (cooker, summary) = run_roots(test_config(), &provider, &sink, &["flaky"]);

    assert_eq!(cooker.item_result(&id("flaky"), &linux()), PlatformResult::Succeeded);
    assert_eq!(provider.save_count("flaky"), 2);
    assert_eq!(summary.retries, 1);
    assert_eq!(sink.count("flaky", &linux()), 1);
}

#[test]
fn second_transient_failure_is_terminal() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "broken",
        Script::default()
            .failing_save(LeafError::Timeout("slow disk".into()))
            .failing_save(LeafError::Transient("slow disk".into())),
    );

    let (cooker, summary) = run_roots(test_config(), &provider, &sink, &["broken"]);

    assert_eq!(cooker.item_result(&id("broken"), &linux()), PlatformResult::Failed);
    assert_eq!(provider.save_count("broken"), 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_items, 1);
    assert_ne!(summary.exit_code(), 0);
    assert_eq!(sink.count("broken", &linux()), 0);
}

#[test]
fn transient_load_failure_goes_back_through_request() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "disk",
        Script::default().failing_load(LeafError::Transient("EAGAIN".into())),
    );

    let (cooker, _summary) = run_roots(test_config(), &provider, &sink, &["disk"]);

    assert_eq!(provider.load_count("disk"), 2);
    assert_eq!(cooker.item_result(&id("disk"), &linux()), PlatformResult::Succeeded);
    assert!(cooker
        .instigator_chain(&id("disk"))
        .first()
        .is_some_and(|link| link.contains("retry")));
}

#[test]
fn content_error_fails_without_retry_and_keeps_chain() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("map", Script::default().imports(&["mesh"]));
    provider.script(
        "mesh",
        Script::default().failing_save(LeafError::Content("bad normals".into())),
    );

    let (cooker, summary) = run_roots(test_config(), &provider, &sink, &["map"]);

    assert_eq!(cooker.item_result(&id("mesh"), &linux()), PlatformResult::Failed);
    assert_eq!(provider.save_count("mesh"), 1);
    assert_eq!(summary.retries, 0);
    let chain = cooker.instigator_chain(&id("mesh"));
    assert!(chain.iter().any(|link| link.contains("map")), "{chain:?}");
}

#[test]
fn not_cookable_is_invalid_and_fails_the_exit_code() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "editor_only",
        Script::default().failing_save(LeafError::NotCookable("editor data".into())),
    );

    let (cooker, summary) = run_roots(test_config(), &provider, &sink, &["editor_only"]);

    assert_eq!(cooker.item_result(&id("editor_only"), &linux()), PlatformResult::Invalid);
    assert_eq!(summary.invalid, 1);
    assert_ne!(summary.exit_code(), 0);
}

#[test]
fn readiness_timeout_counts_as_transient() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "stuck",
        Script {
            never_ready: true,
            ..Script::default()
        },
    );
    let mut config = test_config();
    config.retry.save_timeout_ms = 10;

    let (cooker, summary) = run_roots(config, &provider, &sink, &["stuck"]);

    assert_eq!(cooker.item_result(&id("stuck"), &linux()), PlatformResult::Failed);
    assert_eq!(summary.retries, 1);
    assert_eq!(provider.save_count("stuck"), 0);
}

#[test]
fn build_dependencies_wait_for_the_runtime_phase() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "level",
        Script::default().imports(&["props"]).build(&["shader"]),
    );
    provider.script("props", Script::default().imports(&["texture"]));

    let (cooker, _summary) = run_roots(test_config(), &provider, &sink, &["level"]);

    let loads = provider.loads();
    let position = |raw: &str| loads.iter().position(|loaded| loaded.as_str() == raw).unwrap();
    assert!(position("shader") > position("texture"), "{loads:?}");
    assert_eq!(cooker.item_result(&id("shader"), &linux()), PlatformResult::Succeeded);
}

#[test]
fn soft_references_can_be_skipped() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("hud", Script::default().soft(&["optional_font"]).imports(&["icons"]));
    let mut config = test_config();
    config.session.skip_soft_references = true;

    let (cooker, _summary) = run_roots(config, &provider, &sink, &["hud"]);

    assert_eq!(cooker.item_state(&id("optional_font")), None);
    assert_eq!(cooker.item_result(&id("icons"), &linux()), PlatformResult::Succeeded);
}

#[test]
fn generated_items_are_cooked_and_dropped_on_recook() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script("terrain", Script::default().generates(&["terrain::lightmap"]));

    let mut cooker = local_cooker(test_config(), &provider, &sink, Box::new(MemoryCacheStore::new()));
    cooker
        .request_item("terrain", &[linux()], Urgency::Normal, Instigator::Root)
        .unwrap();
    cooker.run().unwrap();
    assert_eq!(
        cooker.item_result(&id("terrain::lightmap"), &linux()),
        PlatformResult::Succeeded
    );
    assert!(cooker
        .instigator_chain(&id("terrain::lightmap"))
        .iter()
        .any(|link| link.contains("generated by terrain")));

    cooker.force_recook("terrain").unwrap();
    cooker.run().unwrap();
    assert_eq!(provider.load_count("terrain"), 2);
    assert_eq!(provider.load_count("terrain::lightmap"), 2);
}

#[test]
fn multiple_platforms_get_one_result_each() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    let console = cooker_core::types::Platform::new("console");

    let mut cooker = local_cooker(test_config(), &provider, &sink, Box::new(MemoryCacheStore::new()));
    cooker
        .request_item("ui", &[linux(), console.clone()], Urgency::High, Instigator::Root)
        .unwrap();
    let summary = cooker.run().unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(provider.load_count("ui"), 1);
    assert_eq!(sink.count("ui", &linux()), 1);
    assert_eq!(sink.count("ui", &console), 1);
}

#[test]
fn cancel_mid_save_releases_without_result() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    provider.script(
        "stuck",
        Script {
            never_ready: true,
            ..Script::default()
        },
    );

    let mut cooker = local_cooker(test_config(), &provider, &sink, Box::new(MemoryCacheStore::new()));
    cooker
        .request_item("stuck", &[linux()], Urgency::Normal, Instigator::Root)
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while cooker.item_state(&id("stuck")) != Some(ItemState::SaveActive) {
        assert!(Instant::now() < deadline, "item never reached save");
        cooker.tick().unwrap();
    }

    cooker.cancel("stuck").unwrap();
    let mut action = cooker.tick().unwrap();
    while action != CookAction::Done {
        assert!(Instant::now() < deadline, "cancel never finished");
        action = cooker.tick().unwrap();
    }

    assert_eq!(cooker.item_state(&id("stuck")), Some(ItemState::Idle));
    assert_eq!(cooker.item_result(&id("stuck"), &linux()), PlatformResult::NotAttempted);
    assert!(sink.persisted().is_empty());
}

#[test]
fn handle_requests_from_another_thread() {
    let provider = ScriptedProvider::new();
    let sink = RecordingSink::new();
    let mut cooker = local_cooker(test_config(), &provider, &sink, Box::new(MemoryCacheStore::new()));
    let handle = cooker.handle();

    std::thread::spawn(move || {
        handle
            .request_item("remote_root", &[linux()], Urgency::Blocking, Instigator::Root)
            .unwrap();
    })
    .join()
    .unwrap();

    let summary = cooker.run().unwrap();
    assert_eq!(summary.succeeded, 1);
}
