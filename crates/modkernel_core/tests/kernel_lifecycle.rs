use modkernel_core::config::{ConfigKey, ConfigValue};
use modkernel_core::error::KernelError;
use modkernel_core::imc::{CallOptions, FutureState, SubscribeOptions};
use modkernel_core::kernel::{Kernel, RESOURCES_CAPABILITY};
use modkernel_core::resource::{ResourceRegistry, ResourceTypeDescriptor};
use modkernel_core::settings::KernelSettings;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn kernel(dir: &tempfile::TempDir) -> Kernel {
    Kernel::new(KernelSettings::with_config_dir(dir.path())).unwrap()
}

#[test]
fn detach_releases_everything_the_mod_owns() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel(&dir);
    let audio = kernel.attach_mod("audio").unwrap();
    let ui = kernel.attach_mod("ui").unwrap();
    let bus = kernel.bus();

    let volume = ConfigKey::parse("mixer.volume").unwrap();
    kernel
        .config()
        .set(&audio, &volume, ConfigValue::Float(0.5))
        .unwrap();
    let batch = kernel.config().batch_begin(&audio);
    kernel
        .config()
        .batch_set(&audio, batch, ConfigKey::parse("mixer.muted").unwrap(), ConfigValue::Bool(true))
        .unwrap();

    let topic = bus.get_topic_id("audio.levels").unwrap();
    bus.subscribe_ex(&audio, topic, |_| {}, SubscribeOptions::new())
        .unwrap();
    let ui_subscription = bus.subscribe(&ui, topic, |_| {}).unwrap();
    let rpc = bus.get_rpc_id("audio.play").unwrap();
    bus.register_rpc(&audio, rpc, |_| Ok(Vec::new())).unwrap();

    let finalized = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&finalized);
    let sample_type = kernel
        .resources()
        .register_type(
            ResourceTypeDescriptor::new("audio.sample")
                .owned_by(audio.handle())
                .with_finalizer(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
    let sample = kernel.resources().create(sample_type).unwrap();

    kernel.detach_mod(&audio).unwrap();

    let text = std::fs::read_to_string(dir.path().join("audio.toml")).unwrap();
    assert!(text.contains("volume = 0.5"));
    assert!(!text.contains("muted"));
    assert!(!kernel.config().is_cached(&audio));
    assert_eq!(kernel.config().batch_staged_len(batch), None);

    assert_eq!(bus.subscription_count(), 1);
    bus.subscription_queue_len(ui_subscription).unwrap();
    assert!(!bus.is_rpc_registered(rpc));

    assert!(matches!(
        kernel.resources().create(sample_type),
        Err(KernelError::NotFound(_))
    ));
    kernel.resources().release(sample).unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);

    assert!(!kernel.resources().validate(audio.handle()));
    assert_eq!(kernel.attached_mods(), vec![ui]);
}

#[test]
fn reattached_mod_reads_its_persisted_config() {
    let dir = tempfile::tempdir().unwrap();
    let key = ConfigKey::parse("window.width").unwrap();
    {
        let kernel = kernel(&dir);
        let editor = kernel.attach_mod("editor").unwrap();
        kernel
            .config()
            .set(&editor, &key, ConfigValue::Integer(1920))
            .unwrap();
    }

    let kernel = kernel(&dir);
    let editor = kernel.attach_mod("editor").unwrap();
    assert_eq!(kernel.config().get_int(&editor, &key).unwrap(), 1920);
}

#[test]
fn detach_reports_flush_failure_but_still_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, "file").unwrap();
    let kernel = Kernel::new(KernelSettings::with_config_dir(&blocker)).unwrap();
    let net = kernel.attach_mod("net").unwrap();

    kernel
        .config()
        .set(&net, &ConfigKey::parse("socket.port").unwrap(), ConfigValue::Integer(80))
        .unwrap();
    let topic = kernel.bus().get_topic_id("net.packets").unwrap();
    kernel.bus().subscribe(&net, topic, |_| {}).unwrap();

    assert!(matches!(
        kernel.detach_mod(&net),
        Err(KernelError::Io { .. })
    ));
    assert_eq!(kernel.bus().subscription_count(), 0);
    assert!(!kernel.config().is_cached(&net));
    assert!(kernel.attached_mods().is_empty());
}

#[test]
fn shutdown_cancels_outstanding_futures() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel(&dir);
    let server = kernel.attach_mod("server").unwrap();
    let client = kernel.attach_mod("client").unwrap();
    let rpc = kernel.bus().get_rpc_id("server.work").unwrap();
    kernel
        .bus()
        .register_rpc(&server, rpc, |_| Ok(vec![1]))
        .unwrap();

    let future = kernel
        .bus()
        .call_rpc(&client, rpc, &[], CallOptions::deferred())
        .unwrap();
    kernel.shutdown().unwrap();

    assert_eq!(future.state(), FutureState::Cancelled);
    assert!(kernel.attached_mods().is_empty());
    assert!(matches!(
        kernel.attach_mod("late"),
        Err(KernelError::ShuttingDown)
    ));
}

#[test]
fn resolve_rejects_handles_of_other_types() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel(&dir);
    let physics = kernel.attach_mod("physics").unwrap();
    let body_type = kernel
        .resources()
        .register_type(ResourceTypeDescriptor::new("physics.body"))
        .unwrap();
    let body = kernel.resources().create(body_type).unwrap();

    assert_eq!(kernel.resolve_mod(physics.handle()).unwrap(), physics);
    assert!(matches!(
        kernel.resolve_mod(body),
        Err(KernelError::HandleTypeMismatch { .. })
    ));
}

#[test]
fn core_services_are_reachable_through_capabilities() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = kernel(&dir);
    let registry = kernel
        .capabilities()
        .get_as::<ResourceRegistry>(RESOURCES_CAPABILITY)
        .unwrap();

    let handle = registry
        .create(
            registry
                .register_type(ResourceTypeDescriptor::new("shared.view"))
                .unwrap(),
        )
        .unwrap();
    assert!(kernel.resources().validate(handle));
    assert_eq!(kernel.capabilities().descriptors().len(), 3);
}
