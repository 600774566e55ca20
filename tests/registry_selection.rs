mod common;
use crate::common::{ScriptedBackend, init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;

use dagwave::errors::DagwaveError;
use dagwave::exec::{
    BackendCapabilities, BackendRegistry, BackendRequirements, BackendSettings, TaskBackend,
};
use dagwave::types::BackendKind;

type TestResult = Result<(), Box<dyn Error>>;

fn caps(overhead: u64, shared: bool, isolation: bool) -> BackendCapabilities {
    BackendCapabilities {
        max_parallelism: 4,
        token_overhead_per_task: overhead,
        shared_context: shared,
        supports_streaming: false,
        true_isolation: isolation,
        efficient_dependency_passing: shared,
    }
}

fn lean() -> Arc<dyn TaskBackend> {
    Arc::new(
        ScriptedBackend::new()
            .named(BackendKind::Process, "lean")
            .with_capabilities(caps(0, false, false)),
    )
}

fn chatty() -> Arc<dyn TaskBackend> {
    Arc::new(
        ScriptedBackend::new()
            .named(BackendKind::SharedContext, "chatty")
            .with_capabilities(caps(20_000, true, false)),
    )
}

fn two_backends() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(BackendKind::Process, lean);
    registry.register(BackendKind::SharedContext, chatty);
    registry
}

#[tokio::test]
async fn requirements_pick_the_matching_backend() -> TestResult {
    init_tracing();
    with_timeout(async {
        let registry = two_backends();

        let frugal = registry
            .select_best(&BackendRequirements {
                minimize_tokens: true,
                ..Default::default()
            })
            .await?;
        assert_eq!(frugal.name(), "lean");

        let shared = registry
            .select_best(&BackendRequirements {
                needs_shared_context: true,
                ..Default::default()
            })
            .await?;
        assert_eq!(shared.name(), "chatty");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn ties_go_to_registration_order() -> TestResult {
    with_timeout(async {
        let registry = two_backends();
        let picked = registry.select_best(&BackendRequirements::default()).await?;
        assert_eq!(picked.name(), "lean");

        let mut reversed = BackendRegistry::new();
        reversed.register(BackendKind::SharedContext, chatty);
        reversed.register(BackendKind::Process, lean);
        let picked = reversed.select_best(&BackendRequirements::default()).await?;
        assert_eq!(picked.name(), "chatty");
        Ok(())
    })
    .await
}

#[tokio::test]
async fn unavailable_backends_are_never_selected() -> TestResult {
    with_timeout(async {
        let mut registry = BackendRegistry::new();
        registry.register(BackendKind::Process, || {
            Arc::new(
                ScriptedBackend::new()
                    .named(BackendKind::Process, "offline")
                    .with_capabilities(caps(0, false, true))
                    .unavailable(),
            ) as Arc<dyn TaskBackend>
        });
        registry.register(BackendKind::SharedContext, chatty);

        let req = BackendRequirements {
            needs_isolation: true,
            minimize_tokens: true,
            ..Default::default()
        };
        let picked = registry.select_best(&req).await?;
        assert_eq!(picked.name(), "chatty");
        assert_eq!(registry.available_kinds().await, vec![BackendKind::SharedContext]);
        Ok(())
    })
    .await
}

#[tokio::test]
async fn selection_fails_when_nothing_is_available() {
    with_timeout(async {
        let mut registry = BackendRegistry::new();
        registry.register(BackendKind::Process, || {
            Arc::new(ScriptedBackend::new().unavailable()) as Arc<dyn TaskBackend>
        });

        let err = registry
            .select_best(&BackendRequirements::default())
            .await
            .err()
            .expect("no backend is available");
        assert!(matches!(err, DagwaveError::BackendUnavailable(_)));

        let empty = BackendRegistry::new();
        assert!(empty.select_best(&BackendRequirements::default()).await.is_err());
    })
    .await
}

#[tokio::test]
async fn compare_lists_every_registered_backend() {
    with_timeout(async {
        let mut registry = two_backends();
        registry.register(BackendKind::Worktree, || {
            Arc::new(
                ScriptedBackend::new()
                    .named(BackendKind::Worktree, "offline")
                    .unavailable(),
            ) as Arc<dyn TaskBackend>
        });

        let rows = registry.compare().await;
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["lean", "chatty", "offline"]);
        assert_eq!(rows[1].capabilities.token_overhead_per_task, 20_000);
        assert!(rows[1].capabilities.shared_context);
        assert!(!rows[2].available);
        assert!(rows[0].available);
    })
    .await
}

#[test]
fn builtins_register_in_a_fixed_order() -> TestResult {
    let mut registry = BackendRegistry::with_builtins(BackendSettings::default());
    assert_eq!(
        registry.kinds(),
        vec![
            BackendKind::Process,
            BackendKind::Worktree,
            BackendKind::SharedContext
        ]
    );
    assert_eq!(registry.default_kind(), Some(BackendKind::Process));

    registry.set_default(BackendKind::SharedContext)?;
    let backend = registry.default_backend()?;
    assert_eq!(backend.kind(), BackendKind::SharedContext);
    assert_eq!(backend.capabilities().token_overhead_per_task, 20_000);
    assert_eq!(backend.capabilities().max_parallelism, 10);

    let process = registry.create(BackendKind::Process)?;
    assert!(process.capabilities().true_isolation);
    Ok(())
}

#[test]
fn default_must_be_registered() {
    let mut registry = BackendRegistry::new();
    registry.register(BackendKind::Process, lean);
    assert!(registry.set_default(BackendKind::Worktree).is_err());
    assert_eq!(registry.default_kind(), Some(BackendKind::Process));
}
