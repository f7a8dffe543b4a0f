//! Request DTOs for the HTTP API.
//!
//! Each endpoint parses its body into a typed DTO through an explicit
//! `parse` function that either yields the service-layer request or an
//! [`ApiError::InvalidRequest`] with per-field reasons.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use firma_sign_proto::ids::{DocumentId, MessageId, PeerId};
use firma_sign_proto::message::MessageType;
use firma_sign_proto::peer::{GroupRole, GroupSettings};
use firma_sign_proto::transfer::TransferMetadata;

use crate::db::recipients::RecipientPreferences;
use crate::error::{ApiError, FieldError};
use crate::services::groups::{
    CreateGroupRequest, GroupPayload, RequestedMember, SendToGroupRequest,
};
use crate::services::messages::SendMessageOptions;
use crate::services::transfers::{
    CreateTransferRequest, DocumentSignature, SignRequest, SignatureStatus, TransferDocument,
    TransferRecipient,
};

fn invalid(details: Vec<FieldError>) -> ApiError {
    ApiError::InvalidRequest {
        message: "request validation failed".to_string(),
        details,
    }
}

/// Body of `POST /api/connections/initialize`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeConnectionsDto {
    /// Transports to initialize.
    pub transports: Vec<String>,
    /// Per-transport opaque configs, keyed by name.
    #[serde(default)]
    pub config: std::collections::HashMap<String, serde_json::Value>,
}

impl InitializeConnectionsDto {
    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an empty transport list.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.transports.is_empty() {
            return Err(ApiError::invalid("transports", "must not be empty"));
        }
        Ok(())
    }
}

/// One document in a transfer-create body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDocumentDto {
    /// Original file name.
    pub file_name: String,
    /// Content, base64.
    pub data: String,
}

/// One recipient in a transfer-create body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecipientDto {
    /// Transport-specific address.
    pub identifier: String,
    /// Transport name, or `auto`.
    #[serde(default = "default_auto")]
    pub transport: String,
    /// Transports to walk on failure.
    #[serde(default)]
    pub fallback_transports: Vec<String>,
    /// Whether to send notification messages.
    #[serde(default)]
    pub notification_enabled: bool,
}

fn default_auto() -> String {
    "auto".to_string()
}

/// Body of `POST /api/transfers/create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransferDto {
    /// Documents to send.
    #[serde(default)]
    pub documents: Vec<TransferDocumentDto>,
    /// Recipients to notify.
    #[serde(default)]
    pub recipients: Vec<TransferRecipientDto>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: TransferMetadata,
    /// Default transport hint.
    pub transport: Option<String>,
}

impl CreateTransferDto {
    /// Parses into the router's request type.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] listing each invalid field.
    pub fn parse(self) -> Result<CreateTransferRequest, ApiError> {
        let mut details = Vec::new();
        if self.documents.is_empty() {
            details.push(FieldError::new("documents", "must not be empty"));
        }
        if self.recipients.is_empty() {
            details.push(FieldError::new("recipients", "must not be empty"));
        }

        let mut documents = Vec::with_capacity(self.documents.len());
        for (index, doc) in self.documents.into_iter().enumerate() {
            if doc.file_name.is_empty() {
                details.push(FieldError::new(
                    format!("documents[{index}].fileName"),
                    "must not be empty",
                ));
            }
            match BASE64.decode(&doc.data) {
                Ok(data) => documents.push(TransferDocument {
                    file_name: doc.file_name,
                    data,
                }),
                Err(_) => details.push(FieldError::new(
                    format!("documents[{index}].data"),
                    "must be valid base64",
                )),
            }
        }

        let mut recipients = Vec::with_capacity(self.recipients.len());
        for (index, recipient) in self.recipients.into_iter().enumerate() {
            if recipient.identifier.is_empty() {
                details.push(FieldError::new(
                    format!("recipients[{index}].identifier"),
                    "must not be empty",
                ));
                continue;
            }
            recipients.push(TransferRecipient {
                identifier: recipient.identifier,
                transport: recipient.transport,
                preferences: RecipientPreferences {
                    fallback_transports: recipient.fallback_transports,
                    notification_enabled: recipient.notification_enabled,
                },
            });
        }

        if !details.is_empty() {
            return Err(invalid(details));
        }
        Ok(CreateTransferRequest {
            documents,
            recipients,
            metadata: self.metadata,
            transport: self.transport,
        })
    }
}

/// One signature in a sign body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureDto {
    /// The document to sign or reject.
    pub document_id: String,
    /// Signature bytes, base64.
    pub signature: String,
    /// Annotation components, passed through.
    #[serde(default)]
    pub components: serde_json::Value,
    /// `signed` (default) or `rejected`.
    #[serde(default = "default_signed")]
    pub status: String,
}

fn default_signed() -> String {
    "signed".to_string()
}

/// Body of `POST /api/transfers/:id/sign`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTransferDto {
    /// Per-document signatures.
    #[serde(default)]
    pub signatures: Vec<SignatureDto>,
    /// Transport for the reciprocal transfer.
    pub return_transport: Option<String>,
}

impl SignTransferDto {
    /// Parses into the router's request type.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] listing each invalid field.
    pub fn parse(self) -> Result<SignRequest, ApiError> {
        let mut details = Vec::new();
        if self.signatures.is_empty() {
            details.push(FieldError::new("signatures", "must not be empty"));
        }
        let mut signatures = Vec::with_capacity(self.signatures.len());
        for (index, sig) in self.signatures.into_iter().enumerate() {
            let status = match sig.status.as_str() {
                "signed" => SignatureStatus::Signed,
                "rejected" => SignatureStatus::Rejected,
                other => {
                    details.push(FieldError::new(
                        format!("signatures[{index}].status"),
                        format!("unknown status {other:?}"),
                    ));
                    continue;
                }
            };
            signatures.push(DocumentSignature {
                document_id: DocumentId::new(sig.document_id),
                signature: sig.signature,
                components: sig.components,
                status,
            });
        }
        if !details.is_empty() {
            return Err(invalid(details));
        }
        Ok(SignRequest {
            signatures,
            return_transport: self.return_transport,
        })
    }
}

/// Body of `POST /api/peers/discover`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverDto {
    /// Restrict discovery to these transports.
    pub transports: Option<Vec<String>>,
    /// Substring query.
    pub query: Option<String>,
    /// Extra predicates.
    pub filters: DiscoverFiltersDto,
}

/// `filters` object of a discover body.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverFiltersDto {
    /// Only peers currently online.
    pub online: bool,
    /// Only verified peers.
    pub verified: bool,
}

/// Body of `POST /api/peers/:id/connect`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectPeerDto {
    /// Transport to try first.
    pub transport: String,
    /// Transports to walk on failure.
    #[serde(default)]
    pub fallback_transports: Vec<String>,
}

/// Body of `POST /api/peers/:id/transfers`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerTransferDto {
    /// Documents to send.
    #[serde(default)]
    pub documents: Vec<TransferDocumentDto>,
    /// Transport to use.
    pub transport: String,
    /// Transports to walk on failure.
    #[serde(default)]
    pub fallback_transports: Vec<String>,
}

impl PeerTransferDto {
    /// Parses the document list.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] listing each invalid field.
    pub fn parse_documents(&self) -> Result<Vec<TransferDocument>, ApiError> {
        let mut details = Vec::new();
        if self.documents.is_empty() {
            details.push(FieldError::new("documents", "must not be empty"));
        }
        let mut documents = Vec::with_capacity(self.documents.len());
        for (index, doc) in self.documents.iter().enumerate() {
            match BASE64.decode(&doc.data) {
                Ok(data) => documents.push(TransferDocument {
                    file_name: doc.file_name.clone(),
                    data,
                }),
                Err(_) => details.push(FieldError::new(
                    format!("documents[{index}].data"),
                    "must be valid base64",
                )),
            }
        }
        if !details.is_empty() {
            return Err(invalid(details));
        }
        Ok(documents)
    }
}

/// Body of `POST /api/peers/:id/messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageDto {
    /// Message body.
    pub content: String,
    /// Message kind (default `text`).
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
    /// Transport to deliver over.
    pub transport: Option<String>,
    /// Attachments.
    #[serde(default)]
    pub attachments: Vec<firma_sign_proto::message::Attachment>,
    /// Whether the content is encrypted.
    #[serde(default)]
    pub encrypted: bool,
}

impl SendMessageDto {
    /// Parses into the message service's options.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an unknown type or an
    /// empty body.
    pub fn parse(self) -> Result<SendMessageOptions, ApiError> {
        if self.content.is_empty() {
            return Err(ApiError::invalid("content", "must not be empty"));
        }
        let message_type = match self.message_type.as_deref() {
            None => MessageType::Text,
            Some(raw) => MessageType::parse(raw)
                .ok_or_else(|| ApiError::invalid("type", format!("unknown type {raw:?}")))?,
        };
        Ok(SendMessageOptions {
            content: self.content,
            message_type,
            transport: self.transport,
            attachments: self.attachments,
            encrypted: self.encrypted,
        })
    }
}

/// Body of `POST /api/peers/:id/messages/read`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarkReadDto {
    /// Specific messages to mark.
    pub message_ids: Option<Vec<String>>,
    /// Mark every unread message from the peer.
    pub read_all: bool,
}

impl MarkReadDto {
    /// Parses the id list, when present.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] when neither `messageIds`
    /// nor `readAll` is given, or an id is malformed.
    pub fn parse(&self) -> Result<Option<Vec<MessageId>>, ApiError> {
        match (&self.message_ids, self.read_all) {
            (Some(ids), _) => {
                let mut parsed = Vec::with_capacity(ids.len());
                for (index, id) in ids.iter().enumerate() {
                    parsed.push(MessageId::parse(id).map_err(|_| {
                        ApiError::invalid(
                            format!("messageIds[{index}]"),
                            "must be a valid message id",
                        )
                    })?);
                }
                Ok(Some(parsed))
            }
            (None, true) => Ok(None),
            (None, false) => Err(ApiError::invalid(
                "messageIds",
                "provide messageIds or set readAll",
            )),
        }
    }
}

/// One member in a group-create body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberDto {
    /// The peer to add.
    pub peer_id: String,
    /// Their role (default `member`).
    #[serde(default)]
    pub role: Option<String>,
}

/// Body of `POST /api/groups`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupDto {
    /// Group name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Members beyond the owner.
    #[serde(default)]
    pub members: Vec<GroupMemberDto>,
    /// Behavior settings.
    #[serde(default)]
    pub settings: GroupSettings,
    /// Owner peer (defaults to the local node).
    pub owner_id: Option<String>,
}

impl CreateGroupDto {
    /// Parses into the group service's request type.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] listing each invalid field.
    pub fn parse(self) -> Result<CreateGroupRequest, ApiError> {
        let mut details = Vec::new();
        if self.name.trim().is_empty() {
            details.push(FieldError::new("name", "must not be empty"));
        }
        let mut members = Vec::with_capacity(self.members.len());
        for (index, member) in self.members.into_iter().enumerate() {
            let role = match member.role.as_deref() {
                None => GroupRole::Member,
                Some(raw) => match GroupRole::parse(raw) {
                    Some(role) => role,
                    None => {
                        details.push(FieldError::new(
                            format!("members[{index}].role"),
                            format!("unknown role {raw:?}"),
                        ));
                        continue;
                    }
                },
            };
            members.push(RequestedMember {
                peer_id: PeerId::new(member.peer_id),
                role,
            });
        }
        if !details.is_empty() {
            return Err(invalid(details));
        }
        Ok(CreateGroupRequest {
            name: self.name,
            description: self.description,
            members,
            settings: self.settings,
        })
    }
}

/// Body of `POST /api/groups/:id/send`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSendDto {
    /// `message` or `documents`.
    #[serde(rename = "type")]
    pub send_type: String,
    /// Message body, for `message`.
    pub message: Option<String>,
    /// Documents, for `documents`.
    #[serde(default)]
    pub documents: Vec<TransferDocumentDto>,
    /// Transport to use.
    pub transport: Option<String>,
    /// Members to skip.
    #[serde(default)]
    pub exclude_members: Vec<String>,
    /// Sending peer (defaults to the local node).
    pub sender_id: Option<String>,
}

impl GroupSendDto {
    /// Parses into the group service's request type.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an unknown type or a
    /// missing payload.
    pub fn parse(self) -> Result<SendToGroupRequest, ApiError> {
        let payload = match self.send_type.as_str() {
            "message" => {
                let message = self
                    .message
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| ApiError::invalid("message", "required for type=message"))?;
                GroupPayload::Message { message }
            }
            "documents" => {
                if self.documents.is_empty() {
                    return Err(ApiError::invalid("documents", "required for type=documents"));
                }
                let mut documents = Vec::with_capacity(self.documents.len());
                for (index, doc) in self.documents.into_iter().enumerate() {
                    let data = BASE64.decode(&doc.data).map_err(|_| {
                        ApiError::invalid(
                            format!("documents[{index}].data"),
                            "must be valid base64",
                        )
                    })?;
                    documents.push(TransferDocument {
                        file_name: doc.file_name,
                        data,
                    });
                }
                GroupPayload::Documents { documents }
            }
            other => {
                return Err(ApiError::invalid(
                    "type",
                    format!("expected message or documents, got {other:?}"),
                ));
            }
        };
        Ok(SendToGroupRequest {
            payload,
            transport: self.transport,
            exclude_members: self.exclude_members.into_iter().map(PeerId::new).collect(),
        })
    }
}

/// Body of `POST /api/groups/:id/members`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMemberDto {
    /// The peer to add.
    pub peer_id: String,
    /// Their role (default `member`).
    pub role: Option<String>,
}

impl AddMemberDto {
    /// Parses the role.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidRequest`] for an unknown role.
    pub fn parse_role(&self) -> Result<GroupRole, ApiError> {
        match self.role.as_deref() {
            None => Ok(GroupRole::Member),
            Some(raw) => GroupRole::parse(raw)
                .ok_or_else(|| ApiError::invalid("role", format!("unknown role {raw:?}"))),
        }
    }
}
