//! A clinic backend in miniature: requests carry tenant claims, AI note
//! generation is rate limited per branch, every call is audited and
//! confirmations go out through the background dispatcher.
//!
//! Run with `cargo run --example clinical_notes`.

use async_trait::async_trait;
use std::sync::Arc;
use tenantguard::prelude::*;
use tower::{service_fn, ServiceBuilder, ServiceExt};

struct NoteRequest {
    tenant: &'static str,
    branch: &'static str,
    doctor: &'static str,
    patient: &'static str,
}

fn claims(req: &NoteRequest) -> Result<TenantContext, ContextError> {
    Ok(TenantContext::parse(req.tenant, req.branch)?.with_actor(ActorId::new(req.doctor)?))
}

struct Mailer;

#[async_trait]
impl NotificationHandler<Notification> for Mailer {
    async fn handle(&self, job: Notification) -> HandlerResult {
        let tenant = tenant::require_tenant_id()?;
        tracing::info!(tenant = %tenant, channel = %job.channel, to = %job.recipient, subject = %job.subject, "notification sent");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let policy = LimitPolicy::default()
        .with_feature("ai_clinical_note", BucketConfig::per_minute(3, 1.0)?);
    let limiter = Arc::new(KeyedRateLimiter::new(policy));
    let _sweeper = limiter.spawn_sweeper(std::time::Duration::from_secs(60));
    let gate = FeatureGate::new(limiter, "ai_clinical_note");
    let dispatcher = Arc::new(Dispatcher::start(DispatchConfig::default(), Mailer)?);

    let handler = {
        let dispatcher = dispatcher.clone();
        service_fn(move |req: NoteRequest| {
            let gate = gate.clone();
            let dispatcher = dispatcher.clone();
            async move {
                let outcome = gate.run(|| async { format!("SOAP note for {}", req.patient) }).await?;
                if !outcome.is_busy() {
                    let mail = Notification::email("records@clinic.example", "Note drafted", req.patient);
                    if let Err(err) = dispatcher.try_dispatch(mail) {
                        tracing::warn!(error = %err, "confirmation not queued");
                    }
                }
                Ok::<_, ContextError>(outcome.or_busy_message().unwrap_or_else(str::to_owned))
            }
        })
    };

    let svc = ServiceBuilder::new()
        .layer(TenantContextLayer::new(claims))
        .layer(AuditLayer::new("note.generate", Arc::new(TracingAuditSink)))
        .service(handler);

    for (i, branch) in ["downtown", "downtown", "downtown", "downtown", "uptown"].into_iter().enumerate() {
        let req = NoteRequest { tenant: "clinic-42", branch, doctor: "dr-grey", patient: "patient-7" };
        match svc.clone().oneshot(req).await {
            Ok(reply) => println!("request {i} ({branch}): {reply}"),
            Err(err) => println!("request {i} ({branch}) failed: {err}"),
        }
    }

    dispatcher.shutdown().await;
    println!("dispatch stats: {:?}", dispatcher.stats());
    Ok(())
}
