//! Echo call and a ticks subscription over the in-process transport.
//!
//! A small server task answers `echo` calls and pushes a few `ticks`
//! events; the client calls it once and reads the ticks as a stream.
//!
//! Run with: cargo run --example echo_memory

use serde::{Deserialize, Serialize};
use serde_json::json;

use duplex_rpc::{global_hub, LoggingErrorSink, MemoryPeer, Result, RpcClient, RpcConfig};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct EchoRequest<'a> {
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct EchoReply {
    message: String,
}

/// Answer `echo`, push three ticks once `ticks` is subscribed.
async fn serve(mut peer: MemoryPeer) -> Result<()> {
    // ---
    while let Some(frame) = peer.recv_json().await {
        match frame["method"].as_str() {
            Some("echo") => {
                let reply = json!({"id": frame["id"], "ok": true, "result": frame["params"]});
                peer.send_json(&reply).await?;
            }
            Some("subscribe") if frame["params"] == "ticks" => {
                for value in 1..=3 {
                    let tick = json!({"topic": "ticks", "payload": {"value": value.to_string()}});
                    peer.send_json(&tick).await?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RpcConfig::memory("echo");
    let mut listener = global_hub().bind("echo");

    let client = RpcClient::connect(&config, Arc::new(LoggingErrorSink)).await?;

    let peer = listener.accept().await.expect("hub dropped the listener");
    let server = tokio::spawn(serve(peer));

    client.wait_open().await?;

    let reply: EchoReply = client.call("echo", &EchoRequest { message: "hi" }).await?;
    println!("echo -> {}", reply.message);

    let mut ticks = client.subscribe_stream("ticks").await;
    for _ in 0..3 {
        if let Some(tick) = ticks.recv().await {
            println!("tick -> {tick}");
        }
    }

    client.close().await?;
    server.await.expect("server task panicked")?;
    Ok(())
}
