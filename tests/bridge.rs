//! End-to-end tests: native messages routed through the bridge

use nsbridge::interop::{BlockLiteral, NativeBlock, ParamKind};
use nsbridge::object::{dynamic_type, downcast};
use nsbridge::{
    native_object, BaseObject, Bridge, BridgeConfig, CallFrame, Direction, ErrorKind, FromHandle, Implementation,
    ManagedValue, MemoryRuntime, MethodSignature, Module, NativeHandle, NativeObject, NativeRuntime, ObjectCore,
    ObjectRef, ParamDescriptor, ReturnKind, ValueType, WrapperType,
};
use parking_lot::Mutex;
use std::any::TypeId;
use std::sync::Arc;

struct View {
    core: ObjectCore,
}
native_object!(View, core);
impl FromHandle for View {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

struct Button {
    core: ObjectCore,
}
native_object!(Button, core);
impl FromHandle for Button {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

struct Image {
    core: ObjectCore,
}
native_object!(Image, core);
impl FromHandle for Image {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

struct DistantObject {
    core: ObjectCore,
}
native_object!(DistantObject, core);
impl FromHandle for DistantObject {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

struct Delegate {
    core: ObjectCore,
}
native_object!(Delegate, core);
impl FromHandle for Delegate {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

/// Known to Rust only; never part of a registered module
struct Widget {
    core: ObjectCore,
}
native_object!(Widget, core);
impl FromHandle for Widget {
    fn from_handle(handle: NativeHandle) -> Self {
        Self { core: ObjectCore::new(handle) }
    }
}

fn setup() -> (Arc<MemoryRuntime>, Arc<Bridge>) {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.define_class("NSView", Some("NSObject"));
    runtime.define_class("NSButton", Some("NSView"));
    runtime.define_class("NSImage", Some("NSObject"));
    runtime.define_class("NSDistantObject", Some("NSProxy"));

    let bridge = Arc::new(Bridge::with_defaults(runtime.clone()));
    let scan = bridge.register_module(
        &Module::new("appkit")
            .with_type(WrapperType::of::<View>("NSView"))
            .with_type(WrapperType::of::<Button>("NSButton").extends::<View>())
            .with_type(WrapperType::of::<Image>("NSImage"))
            .with_type(WrapperType::of::<DistantObject>("NSDistantObject").proxy())
            .with_type(WrapperType::of::<Delegate>("NSViewDelegate").model()),
    );
    assert_eq!(scan.registered, 4);
    bridge.install();
    (runtime, bridge)
}

fn imp(f: impl Fn(&mut CallFrame) -> nsbridge::Result<ManagedValue> + Send + Sync + 'static) -> Implementation {
    Arc::new(f)
}

#[test]
fn test_register_mark_dead_recreate() {
    let (_runtime, bridge) = setup();
    let handle = NativeHandle::new(0x100).unwrap();
    let a: ObjectRef = Arc::new(View::from_handle(handle));

    bridge.register(&a, handle).unwrap();
    assert!(Arc::ptr_eq(&bridge.resolve(handle).unwrap(), &a));

    bridge.mark_dead(handle);
    assert!(bridge.resolve(handle).is_none());
    assert!(a.live_handle().is_err());

    let b = bridge.get_or_create::<View>(handle).unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(dynamic_type(b.as_ref()), TypeId::of::<View>());
    assert!(Arc::ptr_eq(&bridge.resolve(handle).unwrap(), &b));
}

#[test]
fn test_get_or_create_resolves_concrete_class() {
    let (runtime, bridge) = setup();
    let button = runtime.alloc_named("NSButton");

    let obj = bridge.get_or_create::<BaseObject>(button).unwrap();
    assert!(downcast::<Button>(&obj).is_some());
    assert!(Arc::ptr_eq(&obj, &bridge.get_or_create::<View>(button).unwrap()));
    assert!(bridge.object_for::<View>(0).unwrap().is_none());
}

#[test]
fn test_recycled_address_gets_new_wrapper() {
    let (runtime, bridge) = setup();
    let view = runtime.alloc_named("NSView");
    let old = bridge.get_or_create::<View>(view).unwrap();

    runtime.dealloc(view);
    let image = runtime.alloc_named("NSImage");
    assert_eq!(image, view);

    let fresh = bridge.get_or_create::<Image>(image).unwrap();
    assert!(!Arc::ptr_eq(&old, &fresh));
    assert!(downcast::<Image>(&fresh).is_some());
}

#[test]
fn test_notify_dealloc_clears_wrapper() {
    let (runtime, bridge) = setup();
    let view = runtime.alloc_named("NSView");
    let obj = bridge.get_or_create::<View>(view).unwrap();

    bridge.notify_dealloc(view);
    assert!(obj.handle().is_none());
    assert!(matches!(
        obj.live_handle().unwrap_err().kind,
        ErrorKind::ObjectDisposed { .. }
    ));
}

#[test]
fn test_proxy_refined_by_description() {
    let (runtime, bridge) = setup();
    let proxy = runtime.alloc_named("NSDistantObject");
    runtime.set_description(proxy, "NSImage 0x1234");

    let obj = bridge.get_or_create::<Image>(proxy).unwrap();
    assert!(downcast::<Image>(&obj).is_some());
}

#[test]
fn test_unknown_class_falls_back_to_requested_type() {
    let (runtime, bridge) = setup();
    let unknown = runtime.alloc_named("NSMysteryObject");
    let obj = bridge.get_or_create::<View>(unknown).unwrap();
    assert_eq!(dynamic_type(obj.as_ref()), TypeId::of::<View>());
}

#[test]
fn test_unregistered_type_still_gets_a_wrapper() {
    let runtime = Arc::new(MemoryRuntime::new());
    let bridge = Bridge::with_defaults(runtime.clone());
    let mystery = runtime.alloc_named("NSMystery");

    let obj = bridge.get_or_create::<Widget>(mystery).unwrap();
    assert!(downcast::<Widget>(&obj).is_some());
    assert_eq!(obj.handle(), Some(mystery));
    assert!(Arc::ptr_eq(&obj, &bridge.resolve(mystery).unwrap()));
}

#[test]
fn test_recycled_address_clears_old_wrapper() {
    let (runtime, bridge) = setup();
    let view = runtime.alloc_named("NSView");
    let old = bridge.get_or_create::<View>(view).unwrap();

    runtime.dealloc(view);
    let image = runtime.alloc_named("NSImage");
    let fresh = bridge.get_or_create::<Image>(image).unwrap();

    assert!(old.handle().is_none());
    assert!(matches!(
        old.live_handle().unwrap_err().kind,
        ErrorKind::ObjectDisposed { .. }
    ));
    assert_eq!(fresh.live_handle().unwrap(), image);
}

#[test]
fn test_connect_rejects_unregistered_parameter_types() {
    let (_runtime, bridge) = setup();
    let noop = || Some(imp(|_| Ok(ManagedValue::Void)));

    let sig = MethodSignature::new("setWidget:")
        .param(ParamDescriptor::value(ValueType::I64))
        .param(ParamDescriptor::object::<Widget>());
    let err = bridge.connect_method(TypeId::of::<View>(), &sig, noop()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnresolvedConversion { index: 1, .. }));

    let sig = MethodSignature::new("setWidgets:").param(ParamDescriptor::objects::<Widget>());
    assert!(bridge.connect_method(TypeId::of::<View>(), &sig, noop()).is_err());

    let sig = MethodSignature::new("setOwner:").param(ParamDescriptor::opaque::<Widget>());
    assert!(bridge.connect_method(TypeId::of::<View>(), &sig, noop()).is_err());
    assert_eq!(bridge.binding_count(), 0);
}

#[test]
fn test_native_send_reaches_connected_method() {
    let (runtime, bridge) = setup();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    let sig = MethodSignature::new("setTitle:")
        .param(ParamDescriptor::string())
        .returns(ReturnKind::Value(ValueType::Bool));
    let sel = bridge
        .connect::<View>(
            &sig,
            imp(move |frame| {
                let receiver = frame.receiver.object().map(|o| o.type_name()).unwrap_or("?");
                log.lock().push((receiver, frame.text(0)?.map(str::to_string)));
                Ok(ManagedValue::Word(1))
            }),
        )
        .unwrap();

    // Subclass instances inherit the implementation
    let button = runtime.alloc_named("NSButton");
    let title = runtime.create_string("OK").unwrap();
    assert_eq!(runtime.send(button, sel, &[title.addr()]), 1);
    assert_eq!(runtime.send(button, sel, &[0]), 1);

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, "Button");
    assert_eq!(seen[0].1.as_deref(), Some("OK"));
    assert_eq!(seen[1].1, None);

    let class = runtime.class_by_name("NSView").unwrap();
    let (_, encoding) = runtime.implementation(class, sel).unwrap();
    assert_eq!(encoding, "B@:@");
}

#[test]
fn test_native_send_with_out_parameter() {
    let (runtime, bridge) = setup();
    let produced = runtime.alloc_named("NSImage");
    let sig = MethodSignature::new("imageInto:")
        .param(ParamDescriptor::object_ref::<Image>(Direction::Out))
        .returns(ReturnKind::Value(ValueType::Bool));

    let sel = bridge
        .connect::<View>(
            &sig,
            imp(move |frame| {
                let image: ObjectRef = Arc::new(Image::from_handle(produced));
                frame.set(0, ManagedValue::Object(Some(image)))?;
                Ok(ManagedValue::Word(1))
            }),
        )
        .unwrap();

    let view = runtime.alloc_named("NSView");
    let mut slot: usize = 0;
    let ret = runtime.send(view, sel, &[&mut slot as *mut usize as usize]);
    assert_eq!(ret, 1);
    assert_eq!(slot, produced.addr());
}

#[test]
fn test_native_send_returning_objects_and_strings() {
    let (runtime, bridge) = setup();
    let sel = bridge
        .connect::<View>(
            &MethodSignature::new("title").returns(ReturnKind::String),
            imp(|_| Ok(ManagedValue::Text(Some("Untitled".into())))),
        )
        .unwrap();
    let view = runtime.alloc_named("NSView");
    let text = NativeHandle::new(runtime.send(view, sel, &[])).and_then(|s| runtime.string_value(s));
    assert_eq!(text.as_deref(), Some("Untitled"));

    let sel = bridge
        .connect::<View>(
            &MethodSignature::new("self").returns(ReturnKind::Object),
            imp(|frame| Ok(ManagedValue::Object(frame.receiver.object().cloned()))),
        )
        .unwrap();
    assert_eq!(runtime.send(view, sel, &[]), view.addr());
}

#[test]
fn test_structure_return_through_native_send() {
    let (runtime, bridge) = setup();
    let sel = bridge
        .connect::<View>(
            &MethodSignature::new("frame").returns(ReturnKind::Struct { size: 32 }),
            imp(|_| Ok(ManagedValue::Bytes(vec![7; 32]))),
        )
        .unwrap();

    let view = runtime.alloc_named("NSView");
    let mut rect = [0u8; 32];
    runtime.send_stret(rect.as_mut_ptr().cast(), view, sel, &[]);
    assert_eq!(rect, [7; 32]);

    // Plain sends never enter a structure-returning implementation
    assert_eq!(runtime.send(view, sel, &[]), 0);
}

#[test]
fn test_class_method_dispatch() {
    let (runtime, bridge) = setup();
    let shared = runtime.alloc_named("NSImage");
    let sel = bridge
        .connect::<Image>(
            &MethodSignature::new("sharedImage").class_method().returns(ReturnKind::Object),
            imp(move |frame| {
                assert!(frame.receiver.object().is_none());
                Ok(ManagedValue::Object(Some(Arc::new(Image::from_handle(shared)) as ObjectRef)))
            }),
        )
        .unwrap();

    let class = runtime.class_by_name("NSImage").unwrap();
    let receiver = NativeHandle::new(class.addr()).unwrap();
    assert_eq!(bridge.dispatch(receiver, sel, &[]).unwrap(), shared.addr());
}

#[test]
fn test_connect_method_validation() {
    let (_runtime, bridge) = setup();
    let sig = MethodSignature::new("doThing");
    let noop = || Some(imp(|_| Ok(ManagedValue::Void)));

    let err = bridge.connect_method(TypeId::of::<View>(), &sig, None).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::NullArgument { .. }));

    let err = bridge
        .connect_method(TypeId::of::<View>(), &MethodSignature::new(""), noop())
        .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::NullArgument { .. }));

    let err = bridge.connect_method(TypeId::of::<Delegate>(), &sig, noop()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::IneligibleType { .. }));
    assert!(err.is_argument_error());

    let err = bridge.connect_method(TypeId::of::<String>(), &sig, noop()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::IneligibleType { .. }));

    let floats = MethodSignature::new("setAlpha:").param(ParamDescriptor::value(ValueType::F32));
    let err = bridge.connect_method(TypeId::of::<View>(), &floats, noop()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnsupportedSignature { .. }));

    let by_ref_block = MethodSignature::new("setHandler:")
        .param(ParamDescriptor::new(Direction::Out, ParamKind::Block { arity: 0 }));
    let err = bridge.connect_method(TypeId::of::<View>(), &by_ref_block, noop()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::UnresolvedConversion { index: 0, .. }));

    assert_eq!(bridge.binding_count(), 0);
}

#[test]
fn test_identical_signatures_share_one_adapter() {
    let (_runtime, bridge) = setup();
    let sig = MethodSignature::new("setImage:").param(ParamDescriptor::object::<Image>());
    bridge.connect::<View>(&sig, imp(|_| Ok(ManagedValue::Void))).unwrap();
    bridge.connect::<Image>(&sig, imp(|_| Ok(ManagedValue::Void))).unwrap();

    assert_eq!(bridge.adapters().len(), 1);
    assert_eq!(bridge.binding_count(), 2);
}

#[test]
fn test_dispatch_errors_answer_zero_natively() {
    let (runtime, bridge) = setup();
    let sel = bridge
        .connect::<View>(
            &MethodSignature::new("explode").returns(ReturnKind::Value(ValueType::I64)),
            imp(|_| Err(nsbridge::BridgeError::unsupported("boom"))),
        )
        .unwrap();
    let view = runtime.alloc_named("NSView");
    assert_eq!(runtime.send(view, sel, &[]), 0);

    // Direct dispatch surfaces the error
    assert!(bridge.dispatch(view, sel, &[]).is_err());

    // No binding on an unrelated class
    let image = runtime.alloc_named("NSImage");
    assert!(bridge.dispatch(image, sel, &[]).is_err());
}

#[test]
fn test_dropped_bridge_stops_answering() {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.define_class("NSView", Some("NSObject"));
    let bridge = Arc::new(Bridge::new(runtime.clone(), BridgeConfig::default()));
    bridge.register_module(&Module::new("views").with_type(WrapperType::of::<View>("NSView")));

    let sel = bridge
        .connect::<View>(
            &MethodSignature::new("answer").returns(ReturnKind::Value(ValueType::I64)),
            imp(|_| Ok(ManagedValue::Word(42))),
        )
        .unwrap();
    let view = runtime.alloc_named("NSView");

    // Not installed yet: native calls get no answer
    assert_eq!(runtime.send(view, sel, &[]), 0);
    assert!(bridge.install());
    assert!(!bridge.install());
    assert_eq!(runtime.send(view, sel, &[]), 42);

    drop(bridge);
    assert_eq!(runtime.send(view, sel, &[]), 0);
}

#[test]
fn test_blocks_round_trip_through_a_method() {
    let (runtime, bridge) = setup();
    let sig = MethodSignature::new("enumerate:")
        .param(ParamDescriptor::block(2))
        .returns(ReturnKind::Value(ValueType::U64));
    let sel = bridge
        .connect::<View>(
            &sig,
            imp(|frame| {
                let block = frame.arg(0)?.as_block().copied();
                let total = match block {
                    // SAFETY: blocks passed to enumerate: take two words
                    Some(block) => unsafe { block.invoke(&[40, 2])? },
                    None => 0,
                };
                Ok(ManagedValue::Word(total))
            }),
        )
        .unwrap();

    let block = bridge.create_block(2, Arc::new(|args: &[usize]| args[0] + args[1])).unwrap();
    let global = runtime.class_by_name("__NSConcreteGlobalBlock").unwrap();
    unsafe {
        assert_eq!((*block).isa, global.as_ptr() as *const _);
        assert!(BlockLiteral::user_callable(block).is_some());
    }

    let view = runtime.alloc_named("NSView");
    assert_eq!(runtime.send(view, sel, &[block as usize]), 42);
    assert_eq!(runtime.send(view, sel, &[0]), 0);

    let native = NativeBlock::from_raw(block as *const _, 2).unwrap();
    assert_eq!(unsafe { native.invoke(&[1, 1]) }.unwrap(), 2);
    assert!(bridge.create_block(9, Arc::new(|_: &[usize]| 0)).is_err());
}

#[test]
fn test_config_disables_proxy_refinement() {
    let runtime = Arc::new(MemoryRuntime::new());
    runtime.define_class("NSImage", Some("NSObject"));
    runtime.define_class("NSDistantObject", Some("NSProxy"));
    let config: BridgeConfig = BridgeConfig::from_toml_str("proxy_disambiguation = false\nwarn_on_fallback = false").unwrap();
    let bridge = Bridge::new(runtime.clone(), config);
    bridge.register_module(
        &Module::new("appkit")
            .with_type(WrapperType::of::<Image>("NSImage"))
            .with_type(WrapperType::of::<DistantObject>("NSDistantObject").proxy()),
    );

    let proxy = runtime.alloc_named("NSDistantObject");
    runtime.set_description(proxy, "NSImage 0x1");
    let obj = bridge.get_or_create::<Image>(proxy).unwrap();
    // Fallback still yields the requested type
    assert!(downcast::<Image>(&obj).is_some());
    assert!(!bridge.config().proxy_disambiguation);
}
