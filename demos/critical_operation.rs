//! Runs a content update through the gateway against the in-memory store.
//!
//! `cargo run --example critical_operation`

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

use cms_gateway::gateway::{ExecutionContext, OperationType};
use cms_gateway::persistence::MemoryStore;
use cms_gateway::security::access::{AccessConfig, AccessControl, InMemoryPermissionStore};
use cms_gateway::security::audit_log::{AuditLogger, AuditSink, MemorySink, TracingSink};
use cms_gateway::validation::RuleDescriptor;
use cms_gateway::{utils, Operation, OperationOutput, SecurityContext, SecurityGateway};

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let store = MemoryStore::new();
    let permissions = InMemoryPermissionStore::new();
    permissions.grant_list("editor-1", "content.update").await;

    let trail = MemorySink::new();
    let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingSink), Arc::new(trail.clone())];
    let gateway = SecurityGateway::builder(
        Arc::new(store.clone()),
        AccessControl::new(Arc::new(permissions), AccessConfig::default()),
    )
    .audit(AuditLogger::new(sinks))
    .build();

    let body = {
        let store = store.clone();
        move |ctx: ExecutionContext| {
            let store = store.clone();
            async move {
                let id = ctx.payload["id"].clone();
                store
                    .put(ctx.transaction, &format!("page:{id}"), ctx.payload.clone())
                    .await?;
                Ok::<_, anyhow::Error>(OperationOutput::new(json!({ "id": id, "status": "saved" })))
            }
        }
    };

    let context = SecurityContext::new("editor-1", "10.0.0.7".parse()?, OperationType::Critical);
    let update = |payload| {
        Operation::builder("content.update", payload)
            .permission("content.update")
            .rule(RuleDescriptor::new("required", "id"))
            .rule(RuleDescriptor::new("required", "title"))
            .invalidates("pages")
            .build()
    };

    let ok = gateway
        .execute(&update(json!({"id": 1, "title": "Welcome"})), &context, &body)
        .await?;
    println!("committed: {}", ok.0);

    match gateway.execute(&update(json!({"id": 2})), &context, &body).await {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("rejected: {e}"),
    }

    println!("stored page: {:?}", store.get("page:1").await);
    for record in trail.records() {
        println!("audit: {}", serde_json::to_string(&record)?);
    }
    Ok(())
}
