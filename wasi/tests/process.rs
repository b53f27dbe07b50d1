//! End-to-end guest scenarios over real mounts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;

use wasmbed_rpc::{connection, HandlerError, ResultData};
use wasmbed_wasi::{
    Fdflags, InMemoryFileSystemDevice, Lookupflags, MountPointDescriptor, Oflags, Pipe,
    ProcessOptions, Rights, StdioDescriptor, WasiError, WasiProcess, Whence,
};

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("wasmbed-e2e-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn host_mount(path: &PathBuf, read_only: bool) -> ProcessOptions {
    ProcessOptions {
        mount_points: vec![MountPointDescriptor::WorkspaceFolder {
            path: path.clone(),
            mount_point: String::from("/w"),
            read_only,
        }],
        ..ProcessOptions::default()
    }
}

/// Spec scenario: create a file through the preopen, write, close, reopen
/// read-only and read the bytes back.
#[test]
fn path_open_create_then_read() {
    let root = scratch_dir("create-read");
    let mut process = WasiProcess::new(host_mount(&root, false)).unwrap();

    let fd = process
        .path_open(
            3,
            Lookupflags::empty(),
            "a.txt",
            Oflags::CREAT | Oflags::TRUNC,
            Rights::FD_READ | Rights::FD_WRITE,
            Rights::empty(),
            Fdflags::empty(),
        )
        .unwrap();
    assert_eq!(process.fd_write(fd, b"hi").unwrap(), 2);
    process.fd_close(fd).unwrap();

    let fd = process
        .path_open(
            3,
            Lookupflags::empty(),
            "a.txt",
            Oflags::empty(),
            Rights::FD_READ,
            Rights::empty(),
            Fdflags::empty(),
        )
        .unwrap();
    let mut buf = [0u8; 8];
    let count = process.fd_read(fd, &mut buf).unwrap();
    assert_eq!(count, 2);
    assert_eq!(&buf[..2], b"hi");
    process.fd_close(fd).unwrap();

    std::fs::remove_dir_all(root).unwrap();
}

/// Spec scenario: the same filesystem mounted read-only refuses creation
/// with `Perm` before any backend call.
#[test]
fn read_only_mount_rejects_create_with_perm() {
    let root = scratch_dir("readonly");
    let mut process = WasiProcess::new(host_mount(&root, true)).unwrap();

    let result = process.path_open(
        3,
        Lookupflags::empty(),
        "new.txt",
        Oflags::CREAT,
        Rights::FD_WRITE,
        Rights::empty(),
        Fdflags::empty(),
    );
    assert_eq!(result.err(), Some(WasiError::Perm));
    // The backend was never touched.
    assert!(std::fs::read_dir(&root).unwrap().next().is_none());

    std::fs::remove_dir_all(root).unwrap();
}

#[test]
fn multiple_mounts_resolve_longest_prefix() {
    let data = InMemoryFileSystemDevice::new(false);
    data.add_file("/f.txt", b"outer".to_vec()).unwrap();
    let cache = InMemoryFileSystemDevice::new(false);
    cache.add_file("/f.txt", b"inner".to_vec()).unwrap();

    let options = ProcessOptions {
        mount_points: vec![
            MountPointDescriptor::InMemoryFileSystem {
                file_system: data,
                mount_point: String::from("/data"),
            },
            MountPointDescriptor::InMemoryFileSystem {
                file_system: cache,
                mount_point: String::from("/data/cache"),
            },
        ],
        ..ProcessOptions::default()
    };
    let mut process = WasiProcess::new(options).unwrap();

    // Preopens advertise their absolute mount names.
    let mut name = vec![0u8; 11];
    process.fd_prestat_dir_name(4, &mut name).unwrap();
    assert_eq!(&name, b"/data/cache");

    let fd = process
        .path_open(
            4,
            Lookupflags::empty(),
            "f.txt",
            Oflags::empty(),
            Rights::FD_READ,
            Rights::empty(),
            Fdflags::empty(),
        )
        .unwrap();
    let mut buf = [0u8; 8];
    let count = process.fd_read(fd, &mut buf).unwrap();
    assert_eq!(&buf[..count], b"inner");
}

/// A full little program: args, env, mkdir, write, readdir, seek, stdout.
#[test]
fn guest_program_simulation() {
    let fs = InMemoryFileSystemDevice::new(false);
    fs.add_file("/input.txt", b"input data 12345".to_vec()).unwrap();

    let stdout = Pipe::new();
    let capture = stdout.clone();
    let mut env = BTreeMap::new();
    env.insert(String::from("HOME"), String::from("/app"));
    let options = ProcessOptions {
        args: vec![String::from("myapp"), String::from("run")],
        env,
        mount_points: vec![MountPointDescriptor::InMemoryFileSystem {
            file_system: fs,
            mount_point: String::from("/app"),
        }],
        stdio: wasmbed_wasi::StdioOptions {
            stdout: Some(StdioDescriptor::Pipe(stdout)),
            ..Default::default()
        },
        trace: true,
        ..ProcessOptions::default()
    };
    let mut process = WasiProcess::new(options).unwrap();

    let (argc, _) = process.args_sizes_get();
    assert_eq!(argc, 2);
    assert_eq!(process.environ_get(), vec!["HOME=/app"]);

    // Read the input.
    let input = process
        .path_open(
            3,
            Lookupflags::empty(),
            "input.txt",
            Oflags::empty(),
            Rights::FD_READ | Rights::FD_SEEK,
            Rights::empty(),
            Fdflags::empty(),
        )
        .unwrap();
    let mut buf = [0u8; 64];
    let count = process.fd_read(input, &mut buf).unwrap();
    assert_eq!(&buf[..count], b"input data 12345");
    process.fd_close(input).unwrap();

    // Write the output under a fresh directory.
    process.path_create_directory(3, "out").unwrap();
    let output = process
        .path_open(
            3,
            Lookupflags::empty(),
            "out/result.txt",
            Oflags::CREAT,
            Rights::FD_WRITE | Rights::FD_READ,
            Rights::empty(),
            Fdflags::empty(),
        )
        .unwrap();
    process.fd_write(output, b"processed").unwrap();
    process.fd_seek(output, 0, Whence::Set).unwrap();
    let count = process.fd_read(output, &mut buf).unwrap();
    assert_eq!(&buf[..count], b"processed");
    process.fd_close(output).unwrap();

    // Directory listing sees both entries.
    let entries = process.fd_readdir(3, 0).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec![".", "..", "input.txt", "out"]);

    // Stdout lands in the pipe.
    process.fd_write(1, b"Done!\n").unwrap();
    assert_eq!(capture.drain(), b"Done!\n");

    process.proc_exit(0);
    assert_eq!(process.exit_code(), Some(0));
}

/// Stdin over the RPC transport: the guest's blocking `fd_read` crosses
/// into the host service and comes back with terminal bytes.
#[test]
fn terminal_stdin_blocks_through_rpc() {
    let (client, mut server) = connection().unwrap();
    server
        .on("terminal/read", |_params, sink| {
            sink.set_json(json!({"bytes": [104, 105, 10]}))
        })
        .unwrap();
    server
        .on("terminal/write", |params, _sink| {
            params
                .binary
                .as_ref()
                .map(|_| ())
                .ok_or_else(|| HandlerError::new("missing bytes"))
        })
        .unwrap();
    let server = std::thread::spawn(move || server.serve());

    let client = Arc::new(Mutex::new(client));
    client.lock().unwrap().wait_ready();

    let options = ProcessOptions {
        stdio: wasmbed_wasi::StdioOptions {
            stdin: Some(StdioDescriptor::Terminal {
                client: client.clone(),
            }),
            stdout: Some(StdioDescriptor::Terminal {
                client: client.clone(),
            }),
            ..Default::default()
        },
        ..ProcessOptions::default()
    };
    let mut process = WasiProcess::new(options).unwrap();

    let mut buf = [0u8; 16];
    let count = process.fd_read(0, &mut buf).unwrap();
    assert_eq!(&buf[..count], b"hi\n");
    assert_eq!(process.fd_write(1, b"echo").unwrap(), 4);

    drop(process);
    drop(client);
    server.join().unwrap();
}

/// fd_seek on a character device is an invalid seek.
#[test]
fn chardev_seek_is_spipe() {
    let mut process = WasiProcess::new(ProcessOptions::default()).unwrap();
    assert_eq!(
        process.fd_seek(0, 0, Whence::Set).err(),
        Some(WasiError::SPipe)
    );
}

/// The terminal write protocol reports a clean errno round trip.
#[test]
fn terminal_write_round_trip_errno() {
    let (client, mut server) = connection().unwrap();
    server.on("terminal/write", |_p, _s| Ok(())).unwrap();
    let server_thread = std::thread::spawn(move || server.serve());
    let client = Arc::new(Mutex::new(client));
    client.lock().unwrap().wait_ready();

    let result = client
        .lock()
        .unwrap()
        .send_request(
            "terminal/write",
            Some(wasmbed_rpc::Params::default().binary(vec![1, 2, 3])),
            wasmbed_rpc::ResultType::none(),
        )
        .unwrap();
    assert_eq!(result.errno, 0);
    assert_eq!(result.data, ResultData::None);

    drop(client);
    server_thread.join().unwrap();
}
