//! Concrete request kinds.
//!
//! Each kind describes one request/response pair: the request payload, the
//! expected reply command, and how the reply's result code maps onto the
//! caller-facing result. [`Operation`] wraps a kind with the shared reply
//! handling and the caller's result channel.

use evstore_core::{
    DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion,
    PersistentSubscriptionSettings, Position, ReadDirection, ResolvedEvent, SliceReadStatus,
    StreamEventsSlice, WriteResult,
};
use evstore_core::results::AllEventsSlice;
use evstore_proto::messages::{
    self, CreatePersistentSubscriptionResult, ExistingPersistentSubscriptionResult,
    OperationResult, ReadAllResult, ReadEventResult, ReadStreamResult,
};
use evstore_proto::{Command, Package, UserCredentials};
use prost::Message;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{ClientOperation, InspectionDecision, inspect_not_handled, payload_text};
use crate::error::{ClientError, ClientResult};

/// What a reply means for the caller.
pub(crate) enum Outcome<T> {
    Done(ClientResult<T>),
    /// Transient server condition; resend the request.
    Retry,
}

pub(crate) trait RequestKind: Send + 'static {
    type Response: Message + Default;
    type Output: Send + 'static;

    const NAME: &'static str;
    const RETRIABLE: bool = true;

    fn request_command(&self) -> Command;
    fn response_command(&self) -> Command;
    fn encode_request(&self) -> Vec<u8>;
    fn complete(&self, response: Self::Response) -> Outcome<Self::Output>;
}

/// A request kind bound to a caller waiting for its result.
pub(crate) struct Operation<K: RequestKind> {
    kind: K,
    credentials: Option<UserCredentials>,
    use_tls: bool,
    result: Option<oneshot::Sender<ClientResult<K::Output>>>,
}

impl<K: RequestKind> Operation<K> {
    pub(crate) fn new(
        kind: K,
        credentials: Option<UserCredentials>,
        use_tls: bool,
    ) -> (Self, oneshot::Receiver<ClientResult<K::Output>>) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            kind,
            credentials,
            use_tls,
            result: Some(tx),
        };
        (op, rx)
    }

    fn finish(&mut self, result: ClientResult<K::Output>) {
        if let Some(tx) = self.result.take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

impl<K: RequestKind> ClientOperation for Operation<K> {
    fn name(&self) -> &'static str {
        K::NAME
    }

    fn create_package(&self, correlation_id: Uuid) -> ClientResult<Package> {
        Ok(Package::new(
            self.kind.request_command(),
            correlation_id,
            self.kind.encode_request(),
        )
        .with_credentials(self.credentials.clone()))
    }

    fn inspect(&mut self, package: Package) -> InspectionDecision {
        let expected = self.kind.response_command();
        match package.command {
            cmd if cmd == expected => match package.message::<K::Response>() {
                Ok(response) => match self.kind.complete(response) {
                    Outcome::Done(result) => {
                        self.finish(result);
                        InspectionDecision::EndOperation
                    }
                    Outcome::Retry => InspectionDecision::Retry,
                },
                Err(e) => {
                    self.finish(Err(e.into()));
                    InspectionDecision::EndOperation
                }
            },
            Command::NotAuthenticated => {
                let reason = payload_text(&package, "authentication error");
                self.finish(Err(ClientError::NotAuthenticated(reason)));
                InspectionDecision::EndOperation
            }
            Command::BadRequest => {
                let reason = payload_text(&package, "<no message>");
                self.finish(Err(ClientError::BadRequest(reason)));
                InspectionDecision::EndOperation
            }
            Command::NotHandled => inspect_not_handled(&package, self.use_tls),
            actual => {
                self.finish(Err(ClientError::UnexpectedCommand { expected, actual }));
                InspectionDecision::EndOperation
            }
        }
    }

    fn fail(&mut self, error: ClientError) {
        self.finish(Err(error));
    }

    fn retriable_on_reconnect(&self) -> bool {
        K::RETRIABLE
    }
}

fn log_position(commit: Option<i64>, prepare: Option<i64>) -> Position {
    Position::new(commit.unwrap_or(-1), prepare.unwrap_or(-1))
}

fn unknown_result(name: &str, code: i32) -> ClientError {
    ClientError::Protocol(format!("unexpected {name} result code {code}"))
}

fn convert_events<E>(events: Vec<E>) -> ClientResult<Vec<ResolvedEvent>>
where
    ResolvedEvent: TryFrom<E, Error = evstore_proto::ProtoError>,
{
    events
        .into_iter()
        .map(|e| ResolvedEvent::try_from(e).map_err(ClientError::from))
        .collect()
}

// ── Writes ───────────────────────────────────────────────────────────

pub(crate) struct AppendToStream {
    pub(crate) stream: String,
    pub(crate) expected_version: ExpectedVersion,
    pub(crate) events: Vec<EventData>,
    pub(crate) require_master: bool,
}

impl RequestKind for AppendToStream {
    type Response = messages::WriteEventsCompleted;
    type Output = WriteResult;

    const NAME: &'static str = "AppendToStream";

    fn request_command(&self) -> Command {
        Command::WriteEvents
    }

    fn response_command(&self) -> Command {
        Command::WriteEventsCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::WriteEvents {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version.as_i64(),
            events: self.events.iter().map(EventData::to_wire).collect(),
            require_master: self.require_master,
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<WriteResult> {
        let result = match OperationResult::try_from(response.result) {
            Ok(OperationResult::Success) => Ok(WriteResult::Success {
                next_expected_version: response.last_event_number,
                log_position: log_position(response.commit_position, response.prepare_position),
            }),
            Ok(OperationResult::PrepareTimeout)
            | Ok(OperationResult::CommitTimeout)
            | Ok(OperationResult::ForwardTimeout) => return Outcome::Retry,
            Ok(OperationResult::WrongExpectedVersion) => Ok(WriteResult::WrongExpectedVersion {
                current_version: response.current_version,
                message: response.message,
            }),
            Ok(OperationResult::StreamDeleted) => Ok(WriteResult::StreamDeleted),
            Ok(OperationResult::InvalidTransaction) => Ok(WriteResult::InvalidTransaction),
            Ok(OperationResult::AccessDenied) => Err(ClientError::AccessDenied(format!(
                "write access denied for stream '{}'",
                self.stream
            ))),
            Err(_) => Err(unknown_result(Self::NAME, response.result)),
        };
        Outcome::Done(result)
    }
}

pub(crate) struct DeleteStream {
    pub(crate) stream: String,
    pub(crate) expected_version: ExpectedVersion,
    pub(crate) hard_delete: bool,
    pub(crate) require_master: bool,
}

impl RequestKind for DeleteStream {
    type Response = messages::DeleteStreamCompleted;
    type Output = DeleteResult;

    const NAME: &'static str = "DeleteStream";
    const RETRIABLE: bool = false;

    fn request_command(&self) -> Command {
        Command::DeleteStream
    }

    fn response_command(&self) -> Command {
        Command::DeleteStreamCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::DeleteStream {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version.as_i64(),
            require_master: self.require_master,
            hard_delete: Some(self.hard_delete),
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<DeleteResult> {
        let result = match OperationResult::try_from(response.result) {
            Ok(OperationResult::Success) => Ok(DeleteResult::Success {
                log_position: log_position(response.commit_position, response.prepare_position),
            }),
            Ok(OperationResult::PrepareTimeout)
            | Ok(OperationResult::CommitTimeout)
            | Ok(OperationResult::ForwardTimeout) => return Outcome::Retry,
            Ok(OperationResult::WrongExpectedVersion) => Ok(DeleteResult::WrongExpectedVersion {
                message: response.message,
            }),
            Ok(OperationResult::StreamDeleted) => Ok(DeleteResult::StreamDeleted),
            Ok(OperationResult::InvalidTransaction) => Ok(DeleteResult::InvalidTransaction),
            Ok(OperationResult::AccessDenied) => Err(ClientError::AccessDenied(format!(
                "delete access denied for stream '{}'",
                self.stream
            ))),
            Err(_) => Err(unknown_result(Self::NAME, response.result)),
        };
        Outcome::Done(result)
    }
}

// ── Reads ────────────────────────────────────────────────────────────

pub(crate) struct ReadEvent {
    pub(crate) stream: String,
    pub(crate) event_number: i64,
    pub(crate) resolve_link_tos: bool,
    pub(crate) require_master: bool,
}

impl RequestKind for ReadEvent {
    type Response = messages::ReadEventCompleted;
    type Output = EventReadResult;

    const NAME: &'static str = "ReadEvent";

    fn request_command(&self) -> Command {
        Command::ReadEvent
    }

    fn response_command(&self) -> Command {
        Command::ReadEventCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::ReadEvent {
            event_stream_id: self.stream.clone(),
            event_number: self.event_number,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<EventReadResult> {
        let status = match ReadEventResult::try_from(response.result) {
            Ok(ReadEventResult::Success) => EventReadStatus::Success,
            Ok(ReadEventResult::NotFound) => EventReadStatus::NotFound,
            Ok(ReadEventResult::NoStream) => EventReadStatus::NoStream,
            Ok(ReadEventResult::StreamDeleted) => EventReadStatus::StreamDeleted,
            Ok(ReadEventResult::Error) => {
                return Outcome::Done(Err(ClientError::ServerError(
                    response.error.unwrap_or_else(|| "<no message>".into()),
                )));
            }
            Ok(ReadEventResult::AccessDenied) => {
                return Outcome::Done(Err(ClientError::AccessDenied(format!(
                    "read access denied for stream '{}'",
                    self.stream
                ))));
            }
            Err(_) => return Outcome::Done(Err(unknown_result(Self::NAME, response.result))),
        };
        let event = match status {
            EventReadStatus::Success => match response.event.map(ResolvedEvent::try_from).transpose() {
                Ok(event) => event,
                Err(e) => return Outcome::Done(Err(e.into())),
            },
            _ => None,
        };
        Outcome::Done(Ok(EventReadResult {
            status,
            stream: self.stream.clone(),
            event_number: self.event_number,
            event,
        }))
    }
}

pub(crate) struct ReadStreamEvents {
    pub(crate) stream: String,
    pub(crate) from_event_number: i64,
    pub(crate) max_count: i32,
    pub(crate) resolve_link_tos: bool,
    pub(crate) require_master: bool,
    pub(crate) direction: ReadDirection,
}

impl RequestKind for ReadStreamEvents {
    type Response = messages::ReadStreamEventsCompleted;
    type Output = StreamEventsSlice;

    const NAME: &'static str = "ReadStreamEvents";

    fn request_command(&self) -> Command {
        match self.direction {
            ReadDirection::Forward => Command::ReadStreamEventsForward,
            ReadDirection::Backward => Command::ReadStreamEventsBackward,
        }
    }

    fn response_command(&self) -> Command {
        match self.direction {
            ReadDirection::Forward => Command::ReadStreamEventsForwardCompleted,
            ReadDirection::Backward => Command::ReadStreamEventsBackwardCompleted,
        }
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::ReadStreamEvents {
            event_stream_id: self.stream.clone(),
            from_event_number: self.from_event_number,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<StreamEventsSlice> {
        let status = match ReadStreamResult::try_from(response.result) {
            Ok(ReadStreamResult::Success) | Ok(ReadStreamResult::NotModified) => SliceReadStatus::Success,
            Ok(ReadStreamResult::NoStream) => SliceReadStatus::StreamNotFound,
            Ok(ReadStreamResult::StreamDeleted) => SliceReadStatus::StreamDeleted,
            Ok(ReadStreamResult::Error) => {
                return Outcome::Done(Err(ClientError::ServerError(
                    response.error.unwrap_or_else(|| "<no message>".into()),
                )));
            }
            Ok(ReadStreamResult::AccessDenied) => {
                return Outcome::Done(Err(ClientError::AccessDenied(format!(
                    "read access denied for stream '{}'",
                    self.stream
                ))));
            }
            Err(_) => return Outcome::Done(Err(unknown_result(Self::NAME, response.result))),
        };

        let slice = if status == SliceReadStatus::Success {
            match convert_events(response.events) {
                Ok(events) => StreamEventsSlice {
                    status,
                    stream: self.stream.clone(),
                    from_event_number: self.from_event_number,
                    read_direction: self.direction,
                    events,
                    next_event_number: response.next_event_number,
                    last_event_number: response.last_event_number,
                    is_end_of_stream: response.is_end_of_stream,
                },
                Err(e) => return Outcome::Done(Err(e)),
            }
        } else {
            StreamEventsSlice {
                status,
                stream: self.stream.clone(),
                from_event_number: self.from_event_number,
                read_direction: self.direction,
                events: Vec::new(),
                next_event_number: -1,
                last_event_number: -1,
                is_end_of_stream: true,
            }
        };
        Outcome::Done(Ok(slice))
    }
}

pub(crate) struct ReadAllEvents {
    pub(crate) position: Position,
    pub(crate) max_count: i32,
    pub(crate) resolve_link_tos: bool,
    pub(crate) require_master: bool,
    pub(crate) direction: ReadDirection,
}

impl RequestKind for ReadAllEvents {
    type Response = messages::ReadAllEventsCompleted;
    type Output = AllEventsSlice;

    const NAME: &'static str = "ReadAllEvents";

    fn request_command(&self) -> Command {
        match self.direction {
            ReadDirection::Forward => Command::ReadAllEventsForward,
            ReadDirection::Backward => Command::ReadAllEventsBackward,
        }
    }

    fn response_command(&self) -> Command {
        match self.direction {
            ReadDirection::Forward => Command::ReadAllEventsForwardCompleted,
            ReadDirection::Backward => Command::ReadAllEventsBackwardCompleted,
        }
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::ReadAllEvents {
            commit_position: self.position.commit_position,
            prepare_position: self.position.prepare_position,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<AllEventsSlice> {
        let code = response.result.unwrap_or(ReadAllResult::Success as i32);
        match ReadAllResult::try_from(code) {
            Ok(ReadAllResult::Success) | Ok(ReadAllResult::NotModified) => {}
            Ok(ReadAllResult::Error) => {
                return Outcome::Done(Err(ClientError::ServerError(
                    response.error.unwrap_or_else(|| "<no message>".into()),
                )));
            }
            Ok(ReadAllResult::AccessDenied) => {
                return Outcome::Done(Err(ClientError::AccessDenied(
                    "read access denied for $all".into(),
                )));
            }
            Err(_) => return Outcome::Done(Err(unknown_result(Self::NAME, code))),
        }
        let events = match convert_events(response.events) {
            Ok(events) => events,
            Err(e) => return Outcome::Done(Err(e)),
        };
        Outcome::Done(Ok(AllEventsSlice {
            read_direction: self.direction,
            from_position: Position::new(response.commit_position, response.prepare_position),
            next_position: Position::new(response.next_commit_position, response.next_prepare_position),
            events,
        }))
    }
}

// ── Persistent subscription management ───────────────────────────────

fn settings_dto(group: &str, stream: &str, settings: &PersistentSubscriptionSettings) -> messages::PersistentSubscriptionSettingsDto {
    let millis = |d: std::time::Duration| i32::try_from(d.as_millis()).unwrap_or(i32::MAX);
    messages::PersistentSubscriptionSettingsDto {
        subscription_group_name: group.to_string(),
        event_stream_id: stream.to_string(),
        resolve_link_tos: settings.resolve_link_tos,
        start_from: settings.start_from,
        message_timeout_milliseconds: millis(settings.message_timeout),
        record_statistics: settings.extra_statistics,
        live_buffer_size: settings.live_buffer_size,
        read_batch_size: settings.read_batch_size,
        buffer_size: settings.history_buffer_size,
        max_retry_count: settings.max_retry_count,
        prefer_round_robin: settings.consumer_strategy == evstore_core::ConsumerStrategy::RoundRobin,
        checkpoint_after_time: millis(settings.checkpoint_after),
        checkpoint_max_count: settings.max_checkpoint_count,
        checkpoint_min_count: settings.min_checkpoint_count,
        subscriber_max_count: settings.max_subscriber_count,
        named_consumer_strategy: Some(settings.consumer_strategy.as_str().to_string()),
    }
}

pub(crate) struct CreatePersistentSubscription {
    pub(crate) group: String,
    pub(crate) stream: String,
    pub(crate) settings: PersistentSubscriptionSettings,
}

impl RequestKind for CreatePersistentSubscription {
    type Response = messages::CreatePersistentSubscriptionCompleted;
    type Output = ();

    const NAME: &'static str = "CreatePersistentSubscription";
    const RETRIABLE: bool = false;

    fn request_command(&self) -> Command {
        Command::CreatePersistentSubscription
    }

    fn response_command(&self) -> Command {
        Command::CreatePersistentSubscriptionCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        settings_dto(&self.group, &self.stream, &self.settings).encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<()> {
        let result = match CreatePersistentSubscriptionResult::try_from(response.result) {
            Ok(CreatePersistentSubscriptionResult::Success) => Ok(()),
            Ok(CreatePersistentSubscriptionResult::AlreadyExists) => Err(ClientError::InvalidOperation(
                format!("subscription group '{}' on stream '{}' already exists", self.group, self.stream),
            )),
            Ok(CreatePersistentSubscriptionResult::Fail) => Err(ClientError::ServerError(format!(
                "creating subscription group '{}' failed: {}",
                self.group,
                response.reason.unwrap_or_default()
            ))),
            Ok(CreatePersistentSubscriptionResult::AccessDenied) => Err(ClientError::AccessDenied(
                format!("write access denied for stream '{}'", self.stream),
            )),
            Err(_) => Err(unknown_result(Self::NAME, response.result)),
        };
        Outcome::Done(result)
    }
}

pub(crate) struct UpdatePersistentSubscription {
    pub(crate) group: String,
    pub(crate) stream: String,
    pub(crate) settings: PersistentSubscriptionSettings,
}

impl RequestKind for UpdatePersistentSubscription {
    type Response = messages::UpdatePersistentSubscriptionCompleted;
    type Output = ();

    const NAME: &'static str = "UpdatePersistentSubscription";
    const RETRIABLE: bool = false;

    fn request_command(&self) -> Command {
        Command::UpdatePersistentSubscription
    }

    fn response_command(&self) -> Command {
        Command::UpdatePersistentSubscriptionCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        settings_dto(&self.group, &self.stream, &self.settings).encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<()> {
        Outcome::Done(existing_group_result(
            Self::NAME,
            "updating",
            &self.group,
            &self.stream,
            response,
        ))
    }
}

pub(crate) struct DeletePersistentSubscription {
    pub(crate) group: String,
    pub(crate) stream: String,
}

impl RequestKind for DeletePersistentSubscription {
    type Response = messages::DeletePersistentSubscriptionCompleted;
    type Output = ();

    const NAME: &'static str = "DeletePersistentSubscription";
    const RETRIABLE: bool = false;

    fn request_command(&self) -> Command {
        Command::DeletePersistentSubscription
    }

    fn response_command(&self) -> Command {
        Command::DeletePersistentSubscriptionCompleted
    }

    fn encode_request(&self) -> Vec<u8> {
        messages::DeletePersistentSubscription {
            subscription_group_name: self.group.clone(),
            event_stream_id: self.stream.clone(),
        }
        .encode_to_vec()
    }

    fn complete(&self, response: Self::Response) -> Outcome<()> {
        Outcome::Done(existing_group_result(
            Self::NAME,
            "deleting",
            &self.group,
            &self.stream,
            response,
        ))
    }
}

fn existing_group_result(
    name: &str,
    action: &str,
    group: &str,
    stream: &str,
    response: messages::ExistingPersistentSubscriptionCompleted,
) -> ClientResult<()> {
    match ExistingPersistentSubscriptionResult::try_from(response.result) {
        Ok(ExistingPersistentSubscriptionResult::Success) => Ok(()),
        Ok(ExistingPersistentSubscriptionResult::DoesNotExist) => Err(ClientError::InvalidOperation(
            format!("subscription group '{group}' on stream '{stream}' does not exist"),
        )),
        Ok(ExistingPersistentSubscriptionResult::Fail) => Err(ClientError::ServerError(format!(
            "{action} subscription group '{group}' failed: {}",
            response.reason.unwrap_or_default()
        ))),
        Ok(ExistingPersistentSubscriptionResult::AccessDenied) => Err(ClientError::AccessDenied(
            format!("write access denied for stream '{stream}'"),
        )),
        Err(_) => Err(unknown_result(name, response.result)),
    }
}
