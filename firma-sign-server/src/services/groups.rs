//! Group service: named peer groups with roles and fan-out.

use std::sync::Arc;

use firma_sign_proto::ids::{GroupId, PeerId, TransferId};
use firma_sign_proto::peer::{GroupRole, GroupSettings};
use firma_sign_proto::transfer::{RecipientStatus, TransferMetadata};

use crate::db::groups::{GroupMemberRow, GroupRow};
use crate::db::recipients::RecipientPreferences;
use crate::db::{Database, groups};
use crate::error::ApiError;
use crate::events::{Event, EventBus};
use crate::services::messages::{MessageService, SendMessageOptions};
use crate::services::transfers::{
    CreateTransferRequest, TransferDocument, TransferRecipient, TransferRouter,
};

/// A member requested at group creation.
#[derive(Debug, Clone)]
pub struct RequestedMember {
    /// The peer to add.
    pub peer_id: PeerId,
    /// Their role.
    pub role: GroupRole,
}

/// Request for [`GroupService::create`].
#[derive(Debug, Clone)]
pub struct CreateGroupRequest {
    /// Group name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Members beyond the owner.
    pub members: Vec<RequestedMember>,
    /// Behavior settings.
    pub settings: GroupSettings,
}

/// What to fan out to a group.
#[derive(Debug, Clone)]
pub enum GroupPayload {
    /// A text message for every member.
    Message {
        /// The message body.
        message: String,
    },
    /// Documents sent as one transfer per member.
    Documents {
        /// The documents to send.
        documents: Vec<TransferDocument>,
    },
}

/// Request for [`GroupService::send_to_group`].
#[derive(Debug, Clone)]
pub struct SendToGroupRequest {
    /// What to deliver.
    pub payload: GroupPayload,
    /// Transport to use; the group default, then `auto`, when absent.
    pub transport: Option<String>,
    /// Members to skip, beyond the sender.
    pub exclude_members: Vec<PeerId>,
}

/// Per-member outcome of a group fan-out.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSendResult {
    /// The member.
    pub peer_id: String,
    /// `sent` or `failed`.
    pub status: String,
    /// Failure reason, when failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Named peer groups with roles.
pub struct GroupService {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    messages: Arc<MessageService>,
    router: Arc<TransferRouter>,
}

impl GroupService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        bus: Arc<EventBus>,
        messages: Arc<MessageService>,
        router: Arc<TransferRouter>,
    ) -> Self {
        Self {
            db,
            bus,
            messages,
            router,
        }
    }

    /// Creates a group. The owner is inserted as an admin member; the
    /// whole creation is one unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an empty name or
    /// [`ApiError::Conflict`] for duplicate members.
    pub fn create(&self, owner: &PeerId, request: &CreateGroupRequest) -> Result<GroupRow, ApiError> {
        if request.name.trim().is_empty() {
            return Err(ApiError::invalid("name", "must not be empty"));
        }
        let id = GroupId::new();
        let row = self.db.with_tx(|tx| {
            groups::insert(
                tx,
                &id,
                request.name.trim(),
                request.description.as_deref(),
                owner,
                &request.settings,
            )?;
            for member in &request.members {
                if member.peer_id == *owner {
                    continue;
                }
                groups::add_member(tx, &id, &member.peer_id, member.role)?;
            }
            groups::find(tx, &id)?
                .ok_or_else(|| crate::db::StoreError::not_found("group", id.to_string()))
        })?;

        tracing::info!(group = %id, name = %row.name, members = request.members.len() + 1, "group created");
        self.bus.publish(&Event::GroupCreated {
            group_id: id.to_string(),
            name: row.name.clone(),
        });
        Ok(row)
    }

    /// Loads a group.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn get(&self, id: &GroupId) -> Result<GroupRow, ApiError> {
        self.db
            .with_conn(|conn| groups::find(conn, id))?
            .ok_or_else(|| ApiError::not_found("group", id.to_string()))
    }

    /// Lists a group's members.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown group.
    pub fn members(&self, id: &GroupId) -> Result<Vec<GroupMemberRow>, ApiError> {
        self.get(id)?;
        Ok(self.db.with_conn(|conn| groups::members(conn, id))?)
    }

    /// Adds a member.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] when already a member.
    pub fn add_member(
        &self,
        id: &GroupId,
        peer_id: &PeerId,
        role: GroupRole,
    ) -> Result<(), ApiError> {
        self.get(id)?;
        self.db
            .with_conn(|conn| groups::add_member(conn, id, peer_id, role))?;
        self.bus.publish(&Event::GroupMemberAdded {
            group_id: id.to_string(),
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    /// Removes a member. The owner cannot be removed without an
    /// ownership transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] for the owner,
    /// [`ApiError::NotFound`] for a non-member.
    pub fn remove_member(&self, id: &GroupId, peer_id: &PeerId) -> Result<(), ApiError> {
        self.db
            .with_conn(|conn| groups::remove_member(conn, id, peer_id))?;
        self.bus.publish(&Event::GroupMemberRemoved {
            group_id: id.to_string(),
            peer_id: peer_id.to_string(),
        });
        Ok(())
    }

    /// Changes a member's role. The owner stays admin.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Conflict`] when demoting the owner,
    /// [`ApiError::NotFound`] for a non-member.
    pub fn update_role(
        &self,
        id: &GroupId,
        peer_id: &PeerId,
        role: GroupRole,
    ) -> Result<(), ApiError> {
        self.db
            .with_conn(|conn| groups::update_role(conn, id, peer_id, role))?;
        self.bus.publish(&Event::GroupMemberUpdated {
            group_id: id.to_string(),
            peer_id: peer_id.to_string(),
            role: role.as_str().to_string(),
        });
        Ok(())
    }

    /// Transfers ownership to another member.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] when the target is not a member.
    pub fn transfer_ownership(&self, id: &GroupId, new_owner: &PeerId) -> Result<(), ApiError> {
        self.db
            .with_conn(|conn| groups::transfer_ownership(conn, id, new_owner))?;
        self.bus.publish(&Event::GroupMemberUpdated {
            group_id: id.to_string(),
            peer_id: new_owner.to_string(),
            role: GroupRole::Admin.as_str().to_string(),
        });
        Ok(())
    }

    /// Deletes a group.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown id.
    pub fn delete(&self, id: &GroupId) -> Result<(), ApiError> {
        self.db.with_conn(|conn| groups::delete(conn, id))?;
        Ok(())
    }

    /// Fans a payload out to every member except the sender and the
    /// exclusions, aggregating a per-recipient outcome. The sender must
    /// be a member.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::NotFound`] for an unknown group and
    /// [`ApiError::Forbidden`] for a non-member sender.
    pub async fn send_to_group(
        &self,
        id: &GroupId,
        sender: &PeerId,
        request: &SendToGroupRequest,
    ) -> Result<Vec<GroupSendResult>, ApiError> {
        let group = self.get(id)?;
        let members = self.db.with_conn(|conn| groups::members(conn, id))?;
        if !members.iter().any(|m| m.peer_id == *sender) {
            return Err(ApiError::Forbidden(format!(
                "{sender} is not a member of group {id}"
            )));
        }

        let transport = request
            .transport
            .clone()
            .or_else(|| group.settings.default_transport.clone())
            .unwrap_or_else(|| "auto".to_string());

        let targets: Vec<&GroupMemberRow> = members
            .iter()
            .filter(|m| m.peer_id != *sender && !request.exclude_members.contains(&m.peer_id))
            .collect();

        let mut results = Vec::with_capacity(targets.len());
        for member in targets {
            let outcome = match &request.payload {
                GroupPayload::Message { message } => self
                    .messages
                    .send_from(
                        sender,
                        &member.peer_id,
                        SendMessageOptions {
                            content: message.clone(),
                            message_type: firma_sign_proto::message::MessageType::Text,
                            transport: Some(transport.clone()),
                            attachments: Vec::new(),
                            encrypted: group.settings.require_encryption,
                        },
                    )
                    .map(|_| ()),
                GroupPayload::Documents { documents } => {
                    self.deliver_documents(&member.peer_id, documents, &transport)
                        .await
                }
            };
            results.push(match outcome {
                Ok(()) => GroupSendResult {
                    peer_id: member.peer_id.to_string(),
                    status: "sent".to_string(),
                    error: None,
                },
                Err(e) => GroupSendResult {
                    peer_id: member.peer_id.to_string(),
                    status: "failed".to_string(),
                    error: Some(e.to_string()),
                },
            });
        }

        if let GroupPayload::Message { message } = &request.payload {
            self.bus.publish(&Event::GroupMessage {
                group_id: id.to_string(),
                from: sender.to_string(),
                message: message.clone(),
            });
        }
        Ok(results)
    }

    /// Creates and dispatches a single-recipient transfer for one
    /// member, then verifies the recipient was notified. A member whose
    /// envelope never left the transport layer is reported as failed,
    /// not sent.
    async fn deliver_documents(
        &self,
        member: &PeerId,
        documents: &[TransferDocument],
        transport: &str,
    ) -> Result<(), ApiError> {
        let created = self.router.create_transfer(&CreateTransferRequest {
            documents: documents.to_vec(),
            recipients: vec![TransferRecipient {
                identifier: member.to_string(),
                transport: transport.to_string(),
                preferences: RecipientPreferences::default(),
            }],
            metadata: TransferMetadata::default(),
            transport: Some(transport.to_string()),
        })?;
        let transfer_id = TransferId::new(created.transfer_id);
        self.router.dispatch_transfer(&transfer_id).await?;

        let detail = self.router.get_transfer(&transfer_id)?;
        if let Some(recipient) = detail
            .recipients
            .iter()
            .find(|r| r.status != RecipientStatus::Notified)
        {
            return Err(ApiError::TransportPermanent(
                recipient
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} was not notified", recipient.identifier)),
            ));
        }
        Ok(())
    }
}
