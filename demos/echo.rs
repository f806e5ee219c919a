use amqp_rpc_transport::broker::MemoryBroker;
use amqp_rpc_transport::{Request, Responder, RpcTransport, ServiceFn};
use serde_json::{json, Value};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let broker = MemoryBroker::new();

    let server = RpcTransport::new(broker.clone());
    let echo = ServiceFn::new("echo", |message: Request, responder: Responder| {
        let a = message.get("a").and_then(Value::as_i64).unwrap_or_default();
        responder.ok(json!({ "result": a * 2 }));
    });
    let target = server.listen(Arc::new(echo)).await?;
    println!("Listening on {} ({})", target.queue_name, target.address);

    let client = RpcTransport::new(broker);
    let (p1, p2, p3) = (json!({ "a": 1 }), json!({ "a": 21 }), json!({ "a": 100 }));
    let (first, second, third) = tokio::join!(
        client.send::<_, Value>(&target, &p1),
        client.send::<_, Value>(&target, &p2),
        client.send::<_, Value>(&target, &p3),
    );

    for reply in [first?, second?, third?] {
        println!("Reply: {}", reply);
    }

    Ok(())
}
