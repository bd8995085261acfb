//! Integration tests for the ticket → job queue pipeline.
//!
//! Tests: TicketService → TicketLifecycleHook → JobQueue → Scheduler → handlers
//!
//! Verifies:
//! - An unresolved ticket escalates when its SLA window elapses
//! - Resolving before the window cancels the check; resolving during it is benign
//! - Retries back off and never dispatch before `ready_at`
//! - A panicking handler does not stop the dispatch loop

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use helpdesk_core::TicketId;
    use helpdesk_tickets::{NewTicket, TicketPatch, TicketPriority, TicketStatus};

    use crate::clock::{Clock, ManualClock};
    use crate::config::JobEngineConfig;
    use crate::jobs::{
        CancelOutcome, HandlerFailure, HandlerRegistry, InMemoryEscalationLog, InMemoryJobStore,
        JobFilter, JobKey, JobQueue, JobStatus, JobStore, Notifier, NotifyHandler, QueueName,
        SlaHandler, handler_fn,
    };
    use crate::tickets::{InMemoryTicketRepository, TicketLifecycleHook, TicketService};

    /// Fails the first `failures` calls, then succeeds.
    #[derive(Default)]
    struct FlakyNotifier {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn ticket_created(&self, _ticket_id: TicketId) -> Result<(), HandlerFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(HandlerFailure::new(format!("mail relay unavailable (call {call})")))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryJobStore>,
        queue: Arc<JobQueue>,
        tickets: TicketService,
        escalations: Arc<InMemoryEscalationLog>,
    }

    fn harness(notifier: Arc<dyn Notifier>, config: JobEngineConfig) -> Harness {
        let clock = ManualClock::arc(Utc::now());
        let store = InMemoryJobStore::arc();
        let repo = InMemoryTicketRepository::arc();
        let escalations = Arc::new(InMemoryEscalationLog::new());

        let handlers = HandlerRegistry::new()
            .with(QueueName::Notify, Arc::new(NotifyHandler::new(notifier)))
            .unwrap()
            .with(
                QueueName::Sla,
                Arc::new(SlaHandler::new(repo.clone(), escalations.clone(), clock.clone())),
            )
            .unwrap();
        let queue = Arc::new(JobQueue::new(store.clone(), clock.clone(), handlers, config).unwrap());
        let tickets = TicketService::new(repo, TicketLifecycleHook::new(queue.clone()));

        Harness {
            clock,
            store,
            queue,
            tickets,
            escalations,
        }
    }

    fn default_harness() -> Harness {
        harness(Arc::new(FlakyNotifier::default()), JobEngineConfig::default())
    }

    fn new_ticket() -> NewTicket {
        NewTicket {
            title: "Cannot log in".to_string(),
            description: "SSO loops back to the login page".to_string(),
            priority: TicketPriority::High,
        }
    }

    fn resolve() -> TicketPatch {
        TicketPatch {
            status: Some(TicketStatus::Resolved),
            ..Default::default()
        }
    }

    async fn run_due(h: &Harness, queue: QueueName) -> usize {
        let n = h.queue.scheduler().tick(queue).await.unwrap();
        h.queue.scheduler().wait_idle(queue).await;
        n
    }

    #[tokio::test]
    async fn unresolved_ticket_escalates_after_sla_window() {
        let h = default_harness();
        let ticket = h.tickets.create(new_ticket()).await.unwrap();

        assert_eq!(run_due(&h, QueueName::Notify).await, 1);
        assert_eq!(run_due(&h, QueueName::Sla).await, 0);

        h.clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(run_due(&h, QueueName::Sla).await, 1);

        let escalations = h.escalations.all();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].ticket_id, ticket.id);
        assert_eq!(escalations[0].status, TicketStatus::Open);

        let sla = h
            .store
            .get(&JobKey::for_ticket(QueueName::Sla, ticket.id))
            .await
            .unwrap();
        assert_eq!(sla.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn ticket_resolved_in_time_never_escalates() {
        let h = default_harness();
        let ticket = h.tickets.create(new_ticket()).await.unwrap();

        h.clock.advance(Duration::from_secs(5 * 60));
        h.tickets.update(ticket.id, resolve()).await.unwrap();

        h.clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(run_due(&h, QueueName::Sla).await, 0);
        assert!(h.escalations.all().is_empty());

        let stats = h.queue.stats(QueueName::Sla).await.unwrap();
        assert_eq!(stats.total(), 0);
    }

    #[tokio::test]
    async fn resolving_while_sla_check_runs_is_benign() {
        let h = default_harness();
        let ticket = h.tickets.create(new_ticket()).await.unwrap();
        let sla_key = JobKey::for_ticket(QueueName::Sla, ticket.id);

        h.clock.advance(Duration::from_secs(15 * 60));
        // Claimed and spawned; the handler has not run yet.
        assert_eq!(h.queue.scheduler().tick(QueueName::Sla).await.unwrap(), 1);
        assert_eq!(h.store.get(&sla_key).await.unwrap().status, JobStatus::Active);

        h.tickets.update(ticket.id, resolve()).await.unwrap();
        assert_eq!(
            h.queue.cancel_job(&sla_key).await.unwrap(),
            CancelOutcome::AlreadyStarted
        );

        h.queue.scheduler().wait_idle(QueueName::Sla).await;
        assert_eq!(h.store.get(&sla_key).await.unwrap().status, JobStatus::Completed);
        assert!(h.escalations.all().is_empty());
    }

    #[tokio::test]
    async fn deleted_ticket_sla_check_completes_quietly() {
        let h = default_harness();
        let ticket = h.tickets.create(new_ticket()).await.unwrap();
        h.tickets.remove(ticket.id).await.unwrap();

        h.clock.advance(Duration::from_secs(15 * 60));
        assert_eq!(run_due(&h, QueueName::Sla).await, 1);
        assert!(h.escalations.all().is_empty());
    }

    #[tokio::test]
    async fn notification_retries_with_backoff_until_success() {
        let notifier = Arc::new(FlakyNotifier {
            failures: 2,
            ..Default::default()
        });
        let h = harness(notifier.clone(), JobEngineConfig::default());
        let ticket = h.tickets.create(new_ticket()).await.unwrap();
        let key = JobKey::for_ticket(QueueName::Notify, ticket.id);

        assert_eq!(run_due(&h, QueueName::Notify).await, 1);
        let after_first = h.store.get(&key).await.unwrap();
        assert_eq!(after_first.status, JobStatus::Waiting);
        assert_eq!(after_first.ready_at - h.clock.now(), chrono::Duration::seconds(2));

        // Not before the backoff elapses.
        h.clock.advance(Duration::from_millis(1999));
        assert_eq!(run_due(&h, QueueName::Notify).await, 0);
        h.clock.advance(Duration::from_millis(1));
        assert_eq!(run_due(&h, QueueName::Notify).await, 1);
        let after_second = h.store.get(&key).await.unwrap();
        assert_eq!(after_second.ready_at - h.clock.now(), chrono::Duration::seconds(4));

        h.clock.advance(Duration::from_secs(4));
        assert_eq!(run_due(&h, QueueName::Notify).await, 1);
        let done = h.store.get(&key).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 3);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn notification_fails_terminally_when_budget_spent() {
        let h = harness(
            Arc::new(FlakyNotifier {
                failures: u32::MAX,
                ..Default::default()
            }),
            JobEngineConfig::default(),
        );
        let ticket = h.tickets.create(new_ticket()).await.unwrap();
        let key = JobKey::for_ticket(QueueName::Notify, ticket.id);

        for _ in 0..3 {
            assert_eq!(run_due(&h, QueueName::Notify).await, 1);
            h.clock.advance(Duration::from_secs(60));
        }
        assert_eq!(run_due(&h, QueueName::Notify).await, 0);

        let failed = h.store.get(&key).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(
            failed.last_error.as_deref(),
            Some("mail relay unavailable (call 3)")
        );
    }

    #[tokio::test]
    async fn stats_partition_matches_listing() {
        let h = default_harness();
        for _ in 0..3 {
            h.tickets.create(new_ticket()).await.unwrap();
        }
        run_due(&h, QueueName::Notify).await;

        for queue in QueueName::ALL {
            let stats = h.queue.get_stats(queue.as_str()).await.unwrap();
            let listed = h
                .queue
                .list_jobs(JobFilter::queue(queue), 1, 100)
                .await
                .unwrap();
            assert_eq!(stats.total(), listed.total);
        }
        let sla = h.queue.stats(QueueName::Sla).await.unwrap();
        assert_eq!(sla.delayed, 3);
        let notify = h.queue.stats(QueueName::Notify).await.unwrap();
        assert_eq!(notify.completed, 3);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let handlers = HandlerRegistry::new()
            .with(
                QueueName::Notify,
                handler_fn(|job| {
                    if job.key.as_str() == "notify:bad" {
                        panic!("template missing");
                    }
                    Ok(())
                }),
            )
            .unwrap()
            .with(QueueName::Sla, handler_fn(|_| Ok(())))
            .unwrap();
        let config = JobEngineConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let queue = JobQueue::new(store.clone(), clock, handlers, config).unwrap();
        let workers = queue.start();

        for key in ["notify:bad", "notify:good"] {
            queue
                .submit_job(QueueName::Notify, JobKey::new(key), serde_json::json!({}), Duration::ZERO, 1)
                .await
                .unwrap();
        }

        let good = JobKey::new("notify:good");
        let bad = JobKey::new("notify:bad");
        for _ in 0..200 {
            let g = store.get(&good).await.unwrap().status;
            let b = store.get(&bad).await.unwrap().status;
            if g.is_terminal() && b.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        workers.shutdown().await;

        assert_eq!(store.get(&good).await.unwrap().status, JobStatus::Completed);
        let bad = store.get(&bad).await.unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.last_error.as_deref(), Some("handler panicked: template missing"));
    }

    #[tokio::test]
    async fn resubmitting_a_ticket_job_is_idempotent() {
        let h = default_harness();
        let ticket_id = TicketId::new();
        let hook = TicketLifecycleHook::new(h.queue.clone());

        hook.on_created(ticket_id).await.unwrap();
        h.clock.advance(Duration::from_secs(1));
        hook.on_created(ticket_id).await.unwrap();

        let listed = h
            .queue
            .list_jobs(JobFilter::default(), 1, 10)
            .await
            .unwrap();
        assert_eq!(listed.total, 2);
    }
}
