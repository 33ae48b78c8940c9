//! Bridge Demo
//!
//! Runs a few operations against the in-memory store: a one-shot save, a
//! point-in-time sample query, and a monitoring anchored query that is
//! dropped after a couple of updates.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use storebridge::model::{ObjectType, Sample, SortDescriptor, StoredObject};
use storebridge::{MemStore, MemStoreConfig, Operations, NO_LIMIT};

fn step_sample(store: &MemStore, label: &str, value: f64, minutes_ago: u64) -> StoredObject {
    let start = SystemTime::now() - Duration::from_secs(minutes_ago * 60);
    StoredObject::Sample(Sample {
        id: store.next_object_id(),
        sample_type: ObjectType::new("step_count"),
        label: label.to_string(),
        value,
        start,
        end: start + Duration::from_secs(60),
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let store = Arc::new(MemStore::new(&MemStoreConfig::default())?);
    let ops = Operations::new(Arc::clone(&store));
    let steps = ObjectType::new("step_count");

    let saved = ops
        .save_all(vec![
            step_sample(&store, "morning walk", 1200.0, 90),
            step_sample(&store, "commute", 800.0, 45),
        ])
        .await?;
    println!("saved: {saved}");

    let samples = ops
        .sample_query(
            steps.clone(),
            None,
            NO_LIMIT,
            Some(vec![SortDescriptor::descending("value")]),
        )
        .await?;
    for sample in &samples {
        println!("sample {} {:>8.1} {}", sample.id, sample.value, sample.label);
    }

    let mut updates = ops.anchored_object_query(steps.clone(), None, None, NO_LIMIT, true);
    if let Some(batch) = updates.next().await {
        let batch = batch?;
        println!(
            "initial batch: {} samples, anchor {:?}",
            batch.samples.len(),
            batch.anchor
        );
    }

    ops.save(step_sample(&store, "evening run", 4000.0, 5)).await?;
    if let Some(batch) = updates.next().await {
        let batch = batch?;
        for sample in &batch.samples {
            println!("update: added {} {}", sample.id, sample.label);
        }
    }

    drop(updates);
    for id in store.executed_queries() {
        println!("query {id}: stopped {} time(s)", store.stop_count(id));
    }
    println!("active queries: {}", store.active_queries().len());
    Ok(())
}
