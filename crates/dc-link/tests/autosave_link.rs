mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dc_link::{
    AutosaveConfig, AutosaveHooks, AutosaveManager, ConnectionManager, LinkError, SaveStatus,
};
use serde_json::{json, Value};
use support::{fast_config, unreachable_endpoint, wait_until, FakeBackend};

const SETTINGS_NAMESPACE: &str = "settings";

fn short_config() -> AutosaveConfig {
    AutosaveConfig {
        debounce: Duration::from_millis(40),
        max_wait: Duration::from_millis(400),
        saved_display: Duration::from_millis(50),
        error_display: Duration::from_millis(50),
    }
}

fn link_autosave(
    manager: &ConnectionManager,
    hooks: AutosaveHooks,
) -> AutosaveManager<Value, ()> {
    let manager = manager.clone();
    AutosaveManager::spawn(
        short_config(),
        move |data: Value, kind: String| {
            let manager = manager.clone();
            async move {
                manager
                    .send(SETTINGS_NAMESPACE, &format!("save_{kind}"), &data)
                    .await
            }
        },
        hooks,
    )
}

#[tokio::test]
async fn burst_of_edits_reaches_backend_once() {
    let backend = FakeBackend::start().await;
    let manager = ConnectionManager::new(fast_config(backend.endpoint())).expect("manager");
    manager.connect().await.expect("connect");
    let autosave = link_autosave(&manager, AutosaveHooks::default());

    for step in 0..5 {
        autosave
            .save(json!({"theme": "dark", "step": step}), "preferences")
            .expect("queue");
    }

    assert!(wait_until(|| backend.count_events(SETTINGS_NAMESPACE, "save_preferences") == 1).await);
    assert!(wait_until(|| autosave.status() == SaveStatus::Idle).await);
    let saved = backend
        .received()
        .into_iter()
        .find(|envelope| envelope.event == "save_preferences")
        .expect("save frame");
    assert_eq!(saved.data["step"], json!(4));
    assert!(autosave.last_save_time().is_some());
    assert!(!autosave.has_pending_changes());

    autosave.destroy();
    manager.disconnect().await;
}

#[tokio::test]
async fn unreachable_backend_surfaces_through_error_hook() {
    let manager =
        ConnectionManager::new(fast_config(unreachable_endpoint().await)).expect("manager");
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let hooks = AutosaveHooks::default().on_error(move |err: &LinkError| {
        sink.lock().expect("lock").push(err.clone());
    });
    let autosave = link_autosave(&manager, hooks);

    let result = autosave.save_now(json!({"volume": 3}), "preferences").await;
    assert_eq!(result, Err(LinkError::NotConnected));
    assert_eq!(errors.lock().expect("lock").clone(), vec![LinkError::NotConnected]);
    assert!(wait_until(|| autosave.status() == SaveStatus::Idle).await);

    autosave.destroy();
    manager.disconnect().await;
}
