use std::time::Duration;

use kfetch::{
    client::{Kafka, KafkaOptions},
    executor::TokioExecutor,
    FetchRequest,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .with_file(true)
        .with_line_number(true)
        .init();

    let broker = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9092".to_string());

    let mut options = KafkaOptions::new();
    options
        .client_id("simple_fetch")
        .operation_timeout(Duration::from_secs(5));
    let client = Kafka::new(options, TokioExecutor);

    let mut request = FetchRequest::new(1000, 1);
    request.add("kafka", 0, 0).add_with_max_bytes("kafka", 1, 0, 4096);

    let response = request.send(&client, &broker).await?;
    for entry in response.message_sets() {
        for message in &entry.messages {
            let value = message.value.as_deref().unwrap_or_default();
            println!(
                "[{} - {}] {} - {:?}",
                entry.topic,
                entry.partition,
                message.offset,
                String::from_utf8_lossy(value)
            );
        }
    }

    for (topic, partition, error) in response.errors() {
        println!("[{topic} - {partition}] {error}");
    }
    Ok(())
}
