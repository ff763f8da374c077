//! Service registry conflict semantics through the context surface.

use corio::service::{RegisteredService, Service};
use corio::{ErrorKind, IoContext};

// Two socket-service backends sharing one key type: installing the
// second must fail, and lookups must keep resolving to the first.
#[derive(Debug)]
struct MockSocketServiceA {
    tag: u32,
}

impl Service for MockSocketServiceA {}

impl RegisteredService for MockSocketServiceA {
    type Key = MockSocketServiceA;
}

#[derive(Debug)]
struct MockSocketServiceB;

impl Service for MockSocketServiceB {}

impl RegisteredService for MockSocketServiceB {
    // B indexes under A: the two backends are interchangeable to
    // lookups, so only one may exist.
    type Key = MockSocketServiceA;
}

#[test]
fn second_backend_with_same_key_is_rejected() {
    let ctx = IoContext::new().expect("context");

    ctx.make_service(|| Ok(MockSocketServiceA { tag: 7 }))
        .expect("first backend installs");

    let err = ctx
        .make_service::<MockSocketServiceB, _>(|| Ok(MockSocketServiceB))
        .expect_err("conflicting backend");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // The first instance is the one lookups find.
    let found = ctx
        .find_service::<MockSocketServiceA>()
        .expect("backend still registered");
    assert_eq!(found.tag, 7);
}

#[test]
fn duplicate_concrete_type_is_rejected() {
    let ctx = IoContext::new().expect("context");

    ctx.make_service(|| Ok(MockSocketServiceA { tag: 1 }))
        .expect("first install");
    let err = ctx
        .make_service::<MockSocketServiceA, _>(|| Ok(MockSocketServiceA { tag: 2 }))
        .expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(
        ctx.find_service::<MockSocketServiceA>()
            .expect("registered")
            .tag,
        1
    );
}

#[test]
fn reverse_key_direction_also_conflicts() {
    // Installing the keyed backend first blocks the key type itself.
    let ctx = IoContext::new().expect("context");

    ctx.make_service(|| Ok(MockSocketServiceB))
        .expect("keyed backend installs");
    let err = ctx
        .make_service::<MockSocketServiceA, _>(|| Ok(MockSocketServiceA { tag: 3 }))
        .expect_err("key already taken");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn core_services_are_singletons() {
    let ctx = IoContext::new().expect("context");

    // The context installed its scheduler eagerly; a second one is a
    // conflict.
    let err = ctx
        .make_service::<corio::Scheduler, _>(|| unreachable!("checked before construction"))
        .expect_err("scheduler already present");
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}
