use std::fs;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use qio::{Error, QueueKind, Runtime, Sga};

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("qio-{}-{}", std::process::id(), name))
}

#[test]
fn descriptor_matches_qd() {
    let runtime = Runtime::new().unwrap();
    let path = scratch("descriptor");

    let qd = runtime.create_file(&path, Mode::from_bits_truncate(0o644)).unwrap();
    assert_eq!(runtime.descriptor_of(qd).unwrap(), qd.0);
    assert!(path.exists());

    runtime.close(qd).unwrap();
    assert!(matches!(runtime.close(qd), Err(Error::NotFound(_))));

    fs::remove_file(path).unwrap();
}

#[test]
fn data_operations_unimplemented() {
    let runtime = Runtime::new().unwrap();
    let path = scratch("data");
    fs::write(&path, b"contents").unwrap();

    let qd = runtime
        .create_file_queue(&path, OFlag::O_RDWR, Mode::empty())
        .unwrap();

    assert!(matches!(
        runtime.push(qd, Sga::from("x")),
        Err(Error::Unimplemented { op: "push", kind: QueueKind::File })
    ));
    assert!(matches!(
        runtime.pop(qd),
        Err(Error::Unimplemented { op: "pop", kind: QueueKind::File })
    ));
    assert_eq!(runtime.outstanding(), 0);

    runtime.close(qd).unwrap();
    fs::remove_file(path).unwrap();
}

#[test]
fn network_operations_unsupported() {
    let runtime = Runtime::new().unwrap();
    let path = scratch("network");

    let qd = runtime.create_file(&path, Mode::from_bits_truncate(0o600)).unwrap();

    assert!(matches!(
        runtime.bind(qd, "127.0.0.1:0".parse().unwrap()),
        Err(Error::Unsupported { op: "bind", .. })
    ));
    assert!(matches!(runtime.listen(qd, 3), Err(Error::Unsupported { op: "listen", .. })));
    assert!(matches!(runtime.accept(qd), Err(Error::Unsupported { op: "accept", .. })));
    assert!(matches!(
        runtime.connect(qd, "127.0.0.1:1".parse().unwrap()),
        Err(Error::Unsupported { op: "connect", .. })
    ));

    runtime.close(qd).unwrap();
    fs::remove_file(path).unwrap();
}

#[test]
fn missing_file() {
    let runtime = Runtime::new().unwrap();
    let err = runtime
        .create_file_queue(scratch("missing"), OFlag::O_RDONLY, Mode::empty())
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}
