//! End-to-end transport behaviour over a real client/server thread pair.

use serde_json::json;

use wasmbed_rpc::{connection, errno, HandlerError, Params, ResultData, ResultType};

#[test]
fn fixed_u8_result_round_trip() {
    let (mut client, mut server) = connection().unwrap();
    server
        .on("uint8array", |params, sink| {
            let text = params
                .get_str("p1")
                .ok_or_else(|| HandlerError::new("missing p1"))?;
            sink.write_bytes(text.as_bytes())
        })
        .unwrap();

    let server = std::thread::spawn(move || server.serve());

    client.wait_ready();
    let result = client
        .send_request(
            "uint8array",
            Some(Params::with("p1", "12345678")),
            ResultType::u8(8).unwrap(),
        )
        .unwrap();
    assert_eq!(result.errno, 0);
    assert_eq!(
        result.data,
        ResultData::U8(vec![49, 50, 51, 52, 53, 54, 55, 56])
    );

    drop(client);
    server.join().unwrap();
}

#[test]
fn variable_json_result_takes_exactly_two_rounds() {
    let (mut client, mut server) = connection().unwrap();
    server
        .on("varJSON", |_params, sink| {
            sink.set_json(json!({"name": "vscode", "age": 70}))
        })
        .unwrap();
    server.announce_ready();

    std::thread::scope(|s| {
        let handle = s.spawn(|| {
            client.wait_ready();
            let result = client
                .send_request("varJSON", None, ResultType::variable())
                .unwrap();
            assert_eq!(result.errno, 0);
            assert_eq!(result.data, ResultData::Json(json!({"name": "vscode", "age": 70})));
            client
        });

        // Exactly two rounds: the request and its $/fetchResult.
        assert!(server.handle_next());
        assert!(server.handle_next());
        let client = handle.join().unwrap();
        drop(client);
        // Port is now closed; no third round arrived.
        assert!(!server.handle_next());
    });
}

#[test]
fn no_handler_yields_errno() {
    let (mut client, server) = connection().unwrap();
    let server = std::thread::spawn(move || server.serve());

    client.wait_ready();
    let result = client
        .send_request("missing/method", None, ResultType::none())
        .unwrap();
    assert_eq!(result.errno, errno::NO_HANDLER);
    assert_eq!(result.data, ResultData::None);

    drop(client);
    server.join().unwrap();
}

#[test]
fn handler_failure_yields_errno() {
    let (mut client, mut server) = connection().unwrap();
    server
        .on("explode", |_params, _sink| {
            Err(HandlerError::new("deliberate"))
        })
        .unwrap();
    let server = std::thread::spawn(move || server.serve());

    client.wait_ready();
    let result = client
        .send_request("explode", None, ResultType::none())
        .unwrap();
    assert_eq!(result.errno, errno::HANDLER_FAILED);

    drop(client);
    server.join().unwrap();
}

#[test]
fn reserved_method_names_rejected() {
    let (mut client, mut server) = connection().unwrap();
    assert!(server
        .on("$/fetchResult", |_p, _s| Ok(()))
        .is_err());
    assert!(server.on("$/ready", |_p, _s| Ok(())).is_err());
    assert!(client
        .send_request("$/fetchResult", None, ResultType::none())
        .is_err());
}

#[test]
fn binary_param_travels_inline() {
    let (mut client, mut server) = connection().unwrap();
    server
        .on("sum", |params, sink| {
            let bytes = params
                .binary
                .as_ref()
                .ok_or_else(|| HandlerError::new("missing binary"))?;
            let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
            sink.write_bytes(&sum.to_le_bytes())
        })
        .unwrap();
    let server = std::thread::spawn(move || server.serve());

    client.wait_ready();
    let params = Params::with("tag", "sum").binary(vec![1, 2, 3, 4]);
    let result = client
        .send_request("sum", Some(params), ResultType::u32(4).unwrap())
        .unwrap();
    assert_eq!(result.data, ResultData::U32(vec![10]));

    drop(client);
    server.join().unwrap();
}

#[test]
fn calls_are_fifo_per_client() {
    let (mut client, mut server) = connection().unwrap();
    let mut seen: Vec<u64> = Vec::new();
    let log = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let log_handler = log.clone();
    server
        .on("mark", move |params, _sink| {
            let n = params
                .get_u64("n")
                .ok_or_else(|| HandlerError::new("missing n"))?;
            log_handler.lock().unwrap().push(n);
            Ok(())
        })
        .unwrap();
    let server = std::thread::spawn(move || server.serve());

    client.wait_ready();
    for n in 0..20u64 {
        let result = client
            .send_request("mark", Some(Params::with("n", n)), ResultType::none())
            .unwrap();
        assert_eq!(result.errno, 0);
        seen.push(n);
    }
    drop(client);
    server.join().unwrap();
    assert_eq!(*log.lock().unwrap(), seen);
}
