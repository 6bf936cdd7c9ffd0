//! Volume RPC endpoints

use super::fsm::Command;
use super::server::{Dispatch, Server};
use crate::acl::Capability;
use crate::common::{AuditEventType, Error, Result};
use crate::state::TABLE_VOLUMES;
use crate::structs::{
    QueryMeta, VolumeClaimRequest, VolumeDeregisterRequest, VolumeGetRequest, VolumeGetResponse,
    VolumeListRequest, VolumeListResponse, VolumeRegisterRequest, WriteMeta,
};
use std::collections::HashMap;
use tracing::{info, warn};

impl Server {
    /// List volumes the caller may read, optionally narrowed to one namespace or driver
    pub async fn volume_list(&self, mut req: VolumeListRequest) -> Result<VolumeListResponse> {
        let call = match self.endpoint(&mut req, &["volplane", "volume", "list"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        let identity = &call.identity;
        if !identity.allow_any_namespace(Capability::VolumeRead) {
            let ns = req.query.namespace.as_deref().unwrap_or("*");
            return Err(self.denied(identity, ns, "volume list"));
        }

        let namespace = req.query.namespace.as_deref().filter(|ns| !ns.is_empty());
        let driver = req.driver.as_deref().filter(|d| !d.is_empty());
        let (volumes, index) = self
            .blocking()
            .run(&req.query, |ws, snap| {
                let iter = match driver {
                    Some(driver) => snap.volumes_by_driver(Some(ws), driver),
                    None => snap.volumes(Some(ws)),
                };

                let mut allowed: HashMap<String, bool> = HashMap::new();
                let volumes: Vec<_> = iter
                    .filter(|v| namespace.map_or(true, |ns| v.namespace == ns))
                    .filter(|v| {
                        *allowed.entry(v.namespace.clone()).or_insert_with(|| {
                            identity.allow_namespace_op(&v.namespace, Capability::VolumeRead)
                        })
                    })
                    .collect();
                Ok((volumes, snap.index(TABLE_VOLUMES)))
            })
            .await?;

        let mut resp = VolumeListResponse {
            volumes,
            meta: QueryMeta {
                index,
                ..Default::default()
            },
        };
        self.set_query_meta(&mut resp.meta);
        Ok(resp)
    }

    /// Fetch one volume. Blocks while the ID is absent, then fails with `NotFound`.
    pub async fn volume_get(&self, mut req: VolumeGetRequest) -> Result<VolumeGetResponse> {
        let call = match self.endpoint(&mut req, &["volplane", "volume", "get"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };

        let id = req.id.as_str();
        let (volume, index) = self
            .blocking()
            .run(&req.query, |ws, snap| {
                Ok((snap.volume_by_id(Some(ws), id), snap.index(TABLE_VOLUMES)))
            })
            .await?;

        let volume = volume.ok_or_else(|| Error::NotFound(format!("volume {id}")))?;
        if !call
            .identity
            .allow_namespace_op(&volume.namespace, Capability::VolumeRead)
        {
            return Err(self.denied(&call.identity, &volume.namespace, "volume read"));
        }

        let mut resp = VolumeGetResponse {
            volume,
            meta: QueryMeta {
                index,
                ..Default::default()
            },
        };
        self.set_query_meta(&mut resp.meta);
        Ok(resp)
    }

    /// Register volumes into the request namespace
    pub async fn volume_register(&self, mut req: VolumeRegisterRequest) -> Result<WriteMeta> {
        let call = match self.endpoint(&mut req, &["volplane", "volume", "register"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        let namespace = req.write.namespace.clone();
        if !call
            .identity
            .allow_namespace_op(&namespace, Capability::VolumeCreate)
        {
            return Err(self.denied(&call.identity, &namespace, "volume register"));
        }
        if req.volumes.is_empty() {
            return Err(Error::Validation("no volumes to register".into()));
        }

        for volume in &mut req.volumes {
            volume.namespace = namespace.clone();
            volume.validate()?;
        }

        let ids = join_ids(req.volumes.iter().map(|v| v.id.as_str()));
        let index = self
            .raft_apply(Command::VolumeRegister {
                volumes: req.volumes,
            })
            .await?;

        info!(namespace = %namespace, index, volumes = %ids, "Registered volumes");
        self.audit.log_event(
            AuditEventType::VolumeRegistered,
            call.identity.actor(),
            Some(&namespace),
            Some(ids),
            format!("registered at index {index}"),
        );
        Ok(WriteMeta { index })
    }

    /// Remove volumes. IDs that do not exist are ignored.
    pub async fn volume_deregister(&self, mut req: VolumeDeregisterRequest) -> Result<WriteMeta> {
        let call = match self
            .endpoint(&mut req, &["volplane", "volume", "deregister"])
            .await?
        {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        let namespace = req.write.namespace.clone();
        if !call
            .identity
            .allow_namespace_op(&namespace, Capability::VolumeCreate)
        {
            return Err(self.denied(&call.identity, &namespace, "volume deregister"));
        }
        if req.volume_ids.is_empty() {
            return Err(Error::Validation("missing volume IDs".into()));
        }
        self.ensure_in_namespace(&req.volume_ids, &namespace)?;

        let ids = join_ids(req.volume_ids.iter().map(String::as_str));
        let index = self
            .raft_apply(Command::VolumeDeregister {
                ids: req.volume_ids,
            })
            .await?;

        info!(namespace = %namespace, index, volumes = %ids, "Deregistered volumes");
        self.audit.log_event(
            AuditEventType::VolumeDeregistered,
            call.identity.actor(),
            Some(&namespace),
            Some(ids),
            format!("deregistered at index {index}"),
        );
        Ok(WriteMeta { index })
    }

    /// Take or release a claim on each volume
    pub async fn volume_claim(&self, mut req: VolumeClaimRequest) -> Result<WriteMeta> {
        let call = match self.endpoint(&mut req, &["volplane", "volume", "claim"]).await? {
            Dispatch::Forwarded(resp) => return Ok(resp),
            Dispatch::Local(call) => call,
        };
        let namespace = req.write.namespace.clone();
        if !call
            .identity
            .allow_namespace_op(&namespace, Capability::VolumeMount)
        {
            return Err(self.denied(&call.identity, &namespace, "volume claim"));
        }
        if req.volume_ids.is_empty() {
            return Err(Error::Validation("missing volume IDs".into()));
        }

        let snap = self.state.snapshot();
        for id in &req.volume_ids {
            match snap.volume_by_id(None, id) {
                Some(v) if v.namespace == namespace => {}
                _ => {
                    return Err(Error::NotFound(format!(
                        "volume {id} in namespace {namespace}"
                    )))
                }
            }
        }

        let ids = join_ids(req.volume_ids.iter().map(String::as_str));
        let (mode, release) = (req.mode, req.release);
        let index = self
            .raft_apply(Command::VolumeClaim {
                ids: req.volume_ids,
                mode,
                release,
            })
            .await?;

        let action = if release { "released" } else { "claimed" };
        self.audit.log_event(
            AuditEventType::VolumeClaimed,
            call.identity.actor(),
            Some(&namespace),
            Some(ids),
            format!("{mode} claim {action} at index {index}"),
        );
        Ok(WriteMeta { index })
    }

    /// Existing volumes among `ids` must live in `namespace`
    fn ensure_in_namespace(&self, ids: &[String], namespace: &str) -> Result<()> {
        let snap = self.state.snapshot();
        let foreign = ids
            .iter()
            .filter_map(|id| snap.volume_by_id(None, id))
            .find(|v| v.namespace != namespace);
        if let Some(v) = foreign {
            warn!(volume = %v.id, namespace = %v.namespace, "Volume outside request namespace");
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }
}

fn join_ids<'a>(ids: impl Iterator<Item = &'a str>) -> String {
    ids.collect::<Vec<_>>().join(",")
}

