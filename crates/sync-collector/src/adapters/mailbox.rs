//! Mailbox actor
//!
//! `CollectorService` is `!Send` and lives on the core thread. Everything
//! else talks to it through a `CollectorHandle`, which is `Send + Clone`
//! and forwards each call as a `CollectorRequest` over an mpsc channel.
//! The actor runs on a tokio `LocalSet` and answers over oneshot channels.

use std::rc::Rc;

use shared_types::{Did, Oid, Sindex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::SenderFilterIndex;
use crate::error::{CollectorError, CollectorResult};
use crate::events::{CollectorCommand, CollectorReply, CollectorRequest};
use crate::ports::{CollectorApi, FilterAnnouncement};
use crate::service::CollectorService;

/// Default mailbox capacity
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Runs `CollectorService` on the core thread
pub struct CollectorActor {
    service: Rc<CollectorService>,
    mailbox: mpsc::Receiver<CollectorRequest>,
}

impl CollectorActor {
    /// Create the actor and the handle that feeds it.
    pub fn new(service: Rc<CollectorService>, capacity: usize) -> (Self, CollectorHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                service,
                mailbox: rx,
            },
            CollectorHandle { tx },
        )
    }

    /// Serve requests until every handle is dropped, then stop all stores.
    ///
    /// Must be spawned with `spawn_local` (or awaited inside a `LocalSet`).
    pub async fn run(mut self) {
        info!("[CollectorActor] Started");

        while let Some(request) = self.mailbox.recv().await {
            let name = request.command.name();
            let result = execute(self.service.as_ref(), request.command);
            if let Err(e) = &result {
                warn!(command = name, error = %e, "Collector command failed");
            }
            if request.reply_to.send(result).is_err() {
                debug!(command = name, "Caller went away before the reply");
            }
        }

        self.service.stop();
        info!("[CollectorActor] All handles dropped, shutting down");
    }
}

fn execute(api: &dyn CollectorApi, command: CollectorCommand) -> CollectorResult<CollectorReply> {
    match command {
        CollectorCommand::AddFilter {
            sidx,
            did,
            filter_bytes,
        } => api.add_filter(sidx, did, &filter_bytes)?,
        CollectorCommand::DeviceOnline { sidx, did } => api.device_online(sidx, did)?,
        CollectorCommand::DeviceOffline { sidx, did } => api.device_offline(sidx, did)?,
        CollectorCommand::AcknowledgeFilter {
            sidx,
            did,
            index,
            update_seq,
        } => api.acknowledge_filter(sidx, did, index, update_seq)?,
        CollectorCommand::ComputeFilterToSend {
            sidx,
            did,
            from_base,
        } => {
            return api
                .compute_filter_to_send(sidx, did, from_base)
                .map(CollectorReply::Filter)
        }
        CollectorCommand::ObjectUpdated { sidx, oid } => api.object_updated(sidx, oid)?,
    }
    Ok(CollectorReply::Done)
}

/// Thread-safe handle to a running `CollectorActor`
#[derive(Clone, Debug)]
pub struct CollectorHandle {
    tx: mpsc::Sender<CollectorRequest>,
}

impl CollectorHandle {
    async fn call(&self, command: CollectorCommand) -> CollectorResult<CollectorReply> {
        let (reply_to, reply) = oneshot::channel();
        self.tx
            .send(CollectorRequest { command, reply_to })
            .await
            .map_err(|_| CollectorError::ActorUnavailable)?;
        reply.await.map_err(|_| CollectorError::ActorUnavailable)?
    }

    async fn call_done(&self, command: CollectorCommand) -> CollectorResult<()> {
        self.call(command).await.map(|_| ())
    }

    pub async fn add_filter(
        &self,
        sidx: Sindex,
        did: Did,
        filter_bytes: Vec<u8>,
    ) -> CollectorResult<()> {
        self.call_done(CollectorCommand::AddFilter {
            sidx,
            did,
            filter_bytes,
        })
        .await
    }

    pub async fn device_online(&self, sidx: Sindex, did: Did) -> CollectorResult<()> {
        let command = CollectorCommand::DeviceOnline { sidx, did };
        self.call_done(command).await
    }

    pub async fn device_offline(&self, sidx: Sindex, did: Did) -> CollectorResult<()> {
        let command = CollectorCommand::DeviceOffline { sidx, did };
        self.call_done(command).await
    }

    pub async fn acknowledge_filter(
        &self,
        sidx: Sindex,
        did: Did,
        index: SenderFilterIndex,
        update_seq: u64,
    ) -> CollectorResult<()> {
        self.call_done(CollectorCommand::AcknowledgeFilter {
            sidx,
            did,
            index,
            update_seq,
        })
        .await
    }

    pub async fn compute_filter_to_send(
        &self,
        sidx: Sindex,
        did: Did,
        from_base: bool,
    ) -> CollectorResult<Option<FilterAnnouncement>> {
        match self
            .call(CollectorCommand::ComputeFilterToSend {
                sidx,
                did,
                from_base,
            })
            .await?
        {
            CollectorReply::Filter(announcement) => Ok(announcement),
            CollectorReply::Done => Ok(None),
        }
    }

    pub async fn object_updated(&self, sidx: Sindex, oid: Oid) -> CollectorResult<()> {
        let command = CollectorCommand::ObjectUpdated { sidx, oid };
        self.call_done(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FilterDb, TokioLocalScheduler};
    use crate::domain::{BloomFilter, CollectorConfig};
    use crate::test_utils::{InMemoryCollectorQueue, RecordingDownloads};
    use tokio::task::LocalSet;

    fn service() -> Rc<CollectorService> {
        let service = CollectorService::new(
            FilterDb::in_memory(),
            Rc::new(InMemoryCollectorQueue::new()),
            Rc::new(RecordingDownloads::new()),
            Rc::new(TokioLocalScheduler::new()),
            CollectorConfig::default(),
        )
        .unwrap();
        service.add_store(Sindex(1)).unwrap();
        Rc::new(service)
    }

    #[tokio::test]
    async fn test_handle_works_from_another_task() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (actor, handle) = CollectorActor::new(service(), 8);
                let actor_task = tokio::task::spawn_local(actor.run());

                // The handle crosses into a `Send` task
                let remote = handle.clone();
                let announcement = tokio::spawn(async move {
                    let oid = Oid([4; 16]);
                    remote.object_updated(Sindex(1), oid).await.unwrap();
                    remote
                        .compute_filter_to_send(Sindex(1), Did([2; 16]), false)
                        .await
                        .unwrap()
                })
                .await
                .unwrap()
                .unwrap();

                let filter = BloomFilter::from_bytes(&announcement.bytes).unwrap();
                assert!(filter.contains(&Oid([4; 16])));

                drop(handle);
                actor_task.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_errors_are_returned_to_the_caller() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (actor, handle) = CollectorActor::new(service(), 8);
                tokio::task::spawn_local(actor.run());

                let result = handle.device_online(Sindex(7), Did([1; 16])).await;
                assert!(matches!(result, Err(CollectorError::UnknownStore(_))));
            })
            .await;
    }

    #[tokio::test]
    async fn test_duplicate_online_keeps_actor_running() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let (actor, handle) = CollectorActor::new(service(), 8);
                tokio::task::spawn_local(actor.run());

                let did = Did([1; 16]);
                handle.device_online(Sindex(1), did).await.unwrap();
                handle.device_online(Sindex(1), did).await.unwrap();
                handle.device_offline(Sindex(1), did).await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn test_closed_actor_is_reported() {
        let (actor, handle) = CollectorActor::new(service(), 8);
        drop(actor);

        let result = handle.device_offline(Sindex(1), Did([1; 16])).await;
        assert!(matches!(result, Err(CollectorError::ActorUnavailable)));
    }
}
