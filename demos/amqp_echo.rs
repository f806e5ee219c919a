use amqp_rpc_transport::{ConfigBuilder, Request, Responder, RpcTransport, ServiceFn};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "amqp://127.0.0.1:5672".to_string());
    let config = ConfigBuilder::new()
        .url(url)
        .request_timeout(Duration::from_secs(10))
        .build();

    let server = RpcTransport::amqp(config.clone());
    let echo = ServiceFn::new("echo", |message: Request, responder: Responder| {
        let a = message.get("a").and_then(Value::as_i64).unwrap_or_default();
        responder.ok(json!({ "result": a * 2 }));
    });
    let target = server.listen(Arc::new(echo)).await?;
    println!("Listening on {} ({})", target.queue_name, target.address);

    let client = RpcTransport::amqp(config);
    let reply: Value = client.send(&target, &json!({ "a": 21 })).await?;
    println!("Reply: {}", reply);

    Ok(())
}
