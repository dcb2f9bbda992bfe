//! Message router: explicit service dispatch to registered classes.

use bytes::BufMut;
use std::net::SocketAddrV4;
use tracing::{debug, info, warn};

use crate::app::AdapterApplication;
use crate::encap::cpf::SockaddrInfo;
use crate::engine::Engine;
use crate::socket::SocketDriver;

use super::epath::{RequestPath, parse_request_path};
use super::error::{Error, GeneralStatus, Result};
use super::types::{ClassCode, REPLY_SERVICE_FLAG, ServiceCode};

/// A decoded message router request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRouterRequest<'a> {
    pub service: u8,
    pub path: RequestPath,
    pub data: &'a [u8],
}

impl<'a> MessageRouterRequest<'a> {
    /// Parse service byte, padded path and data from `data`.
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::Truncated {
                expected: 2,
                actual: data.len(),
            });
        }
        let service = data[0];
        let path_words = data[1];
        let mut rest = &data[2..];
        let path = parse_request_path(path_words, &mut rest)?;
        Ok(Self {
            service,
            path,
            data: rest,
        })
    }
}

/// A message router response ready for encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRouterResponse {
    pub reply_service: u8,
    pub general_status: u8,
    /// Up to two words of additional status.
    pub additional_status: Vec<u16>,
    pub data: Vec<u8>,
}

impl MessageRouterResponse {
    /// Successful response with service data.
    pub fn success(service: u8, data: Vec<u8>) -> Self {
        Self {
            reply_service: REPLY_SERVICE_FLAG | service,
            general_status: GeneralStatus::SUCCESS,
            additional_status: Vec::new(),
            data,
        }
    }

    /// Error response with a bare general status.
    pub fn error(service: u8, general_status: u8) -> Self {
        Self {
            reply_service: REPLY_SERVICE_FLAG | service,
            general_status,
            additional_status: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Encode: reply service, reserved byte, general status,
    /// additional-status word count, words, data.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.reply_service);
        buf.put_u8(0);
        buf.put_u8(self.general_status);
        buf.put_u8(self.additional_status.len() as u8);
        for word in &self.additional_status {
            buf.put_u16_le(*word);
        }
        buf.put_slice(&self.data);
    }
}

/// Context threaded through explicit request handling.
///
/// Forward-open fills the sockaddr reply slots; the encapsulation
/// layer appends them to the response CPF frame.
#[derive(Debug)]
pub struct ExplicitContext {
    pub originator: SocketAddrV4,
    pub session: u32,
    /// Sockaddr items the request carried (forward-open may name the
    /// originator's consuming port here).
    pub request_sockaddr: [Option<SockaddrInfo>; 2],
    pub sockaddr_reply: [Option<SockaddrInfo>; 2],
}

impl ExplicitContext {
    pub fn new(originator: SocketAddrV4, session: u32) -> Self {
        Self {
            originator,
            session,
            request_sockaddr: [None, None],
            sockaddr_reply: [None, None],
        }
    }

    /// Claim a free sockaddr reply slot.
    pub(crate) fn push_sockaddr(&mut self, info: SockaddrInfo) {
        if let Some(slot) = self.sockaddr_reply.iter_mut().find(|s| s.is_none()) {
            *slot = Some(info);
        }
    }
}

impl<D: SocketDriver, A: AdapterApplication> Engine<D, A> {
    /// Route one explicit service request and produce the response.
    pub(crate) fn route_request(
        &mut self,
        data: &[u8],
        ctx: &mut ExplicitContext,
    ) -> MessageRouterResponse {
        let request = match MessageRouterRequest::decode(data) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "malformed message router request");
                let service = data.first().copied().unwrap_or(0);
                return MessageRouterResponse::error(service, GeneralStatus::PATH_SEGMENT_ERROR);
            }
        };
        debug!(
            service = format_args!("{:#04x}", request.service),
            class = request.path.class_id,
            instance = request.path.instance_id,
            "routing explicit request"
        );
        self.dispatch(&request, ctx)
    }

    fn dispatch(
        &mut self,
        request: &MessageRouterRequest<'_>,
        ctx: &mut ExplicitContext,
    ) -> MessageRouterResponse {
        let Some(class) = self.registry.class(request.path.class_id) else {
            warn!(class = request.path.class_id, "request for unregistered class");
            return MessageRouterResponse::error(
                request.service,
                GeneralStatus::PATH_DESTINATION_UNKNOWN,
            );
        };
        let class_id = class.class_id;

        // Connection manager services carry their own semantics.
        if class_id == ClassCode::CONNECTION_MANAGER {
            if request.service == ServiceCode::FORWARD_OPEN {
                return self.forward_open(request, ctx, false);
            }
            if request.service == ServiceCode::LARGE_FORWARD_OPEN {
                return self.forward_open(request, ctx, true);
            }
            if request.service == ServiceCode::FORWARD_CLOSE {
                return self.forward_close(request);
            }
            if request.service == ServiceCode::UNCONNECTED_SEND {
                return self.unconnected_send(request, ctx);
            }
            if request.service == ServiceCode::GET_CONNECTION_OWNER {
                return MessageRouterResponse::success(request.service, Vec::new());
            }
        }

        // Assembly data writes go through the application veto.
        if class_id == ClassCode::ASSEMBLY
            && request.service == ServiceCode::SET_ATTRIBUTE_SINGLE
            && request.path.attribute_id == Some(3)
            && request.path.instance_id != 0
        {
            return self.set_assembly_data(request);
        }

        if request.service == ServiceCode::RESET && class_id == ClassCode::IDENTITY {
            info!("identity reset requested");
            return MessageRouterResponse::success(request.service, Vec::new());
        }

        self.generic_service(request)
    }

    /// The generic attribute engine shared by all leaf classes.
    fn generic_service(&mut self, request: &MessageRouterRequest<'_>) -> MessageRouterResponse {
        let path = request.path;
        let class = self
            .registry
            .class(path.class_id)
            .expect("dispatch checked the class");

        if path.instance_id != 0 && class.instance(path.instance_id).is_none() {
            return MessageRouterResponse::error(
                request.service,
                GeneralStatus::PATH_DESTINATION_UNKNOWN,
            );
        }
        if !class.supports_service(path.instance_id, request.service) {
            return MessageRouterResponse::error(
                request.service,
                GeneralStatus::SERVICE_NOT_SUPPORTED,
            );
        }

        if request.service == ServiceCode::GET_ATTRIBUTE_SINGLE {
            let Some(attribute_id) = path.attribute_id else {
                return MessageRouterResponse::error(
                    request.service,
                    GeneralStatus::PATH_SEGMENT_ERROR,
                );
            };
            return match self.registry.get_attribute_single(
                path.class_id,
                path.instance_id,
                attribute_id as u16,
            ) {
                Ok(data) => MessageRouterResponse::success(request.service, data),
                Err(status) => MessageRouterResponse::error(request.service, status),
            };
        }

        if request.service == ServiceCode::SET_ATTRIBUTE_SINGLE {
            let Some(attribute_id) = path.attribute_id else {
                return MessageRouterResponse::error(
                    request.service,
                    GeneralStatus::PATH_SEGMENT_ERROR,
                );
            };
            return match self.registry.set_attribute_single(
                path.class_id,
                path.instance_id,
                attribute_id as u16,
                request.data,
            ) {
                Ok(()) => MessageRouterResponse::success(request.service, Vec::new()),
                Err(status) => MessageRouterResponse::error(request.service, status),
            };
        }

        if request.service == ServiceCode::GET_ATTRIBUTE_ALL {
            return match self
                .registry
                .get_attribute_all(path.class_id, path.instance_id)
            {
                Ok(data) => MessageRouterResponse::success(request.service, data),
                Err(status) => MessageRouterResponse::error(request.service, status),
            };
        }

        MessageRouterResponse::error(request.service, GeneralStatus::SERVICE_NOT_SUPPORTED)
    }

    /// SetAttributeSingle on an assembly's data attribute.
    fn set_assembly_data(&mut self, request: &MessageRouterRequest<'_>) -> MessageRouterResponse {
        let instance_id = request.path.instance_id;
        if self
            .registry
            .instance(ClassCode::ASSEMBLY, instance_id)
            .is_none()
        {
            return MessageRouterResponse::error(
                request.service,
                GeneralStatus::PATH_DESTINATION_UNKNOWN,
            );
        }
        if self.assembly_data(instance_id).map(<[u8]>::len) != Some(request.data.len()) {
            let status = if self
                .assembly_data(instance_id)
                .is_some_and(|data| data.len() > request.data.len())
            {
                GeneralStatus::NOT_ENOUGH_DATA
            } else {
                GeneralStatus::TOO_MUCH_DATA
            };
            return MessageRouterResponse::error(request.service, status);
        }
        if self.write_assembly_data(instance_id, request.data) {
            MessageRouterResponse::success(request.service, Vec::new())
        } else {
            MessageRouterResponse::error(request.service, GeneralStatus::INVALID_ATTRIBUTE_VALUE)
        }
    }

    /// UnconnectedSend addressed at this single-port target: unwrap
    /// the embedded request and route it locally.
    fn unconnected_send(
        &mut self,
        request: &MessageRouterRequest<'_>,
        ctx: &mut ExplicitContext,
    ) -> MessageRouterResponse {
        // priority/tick, timeout ticks, embedded message size
        if request.data.len() < 4 {
            return MessageRouterResponse::error(request.service, GeneralStatus::NOT_ENOUGH_DATA);
        }
        let size = u16::from_le_bytes([request.data[2], request.data[3]]) as usize;
        let rest = &request.data[4..];
        if rest.len() < size {
            return MessageRouterResponse::error(request.service, GeneralStatus::NOT_ENOUGH_DATA);
        }
        let embedded = rest[..size].to_vec();
        debug!(size, "unwrapping UnconnectedSend");
        // The route path after the embedded request names this port;
        // bridged routing is not supported, so it is not interpreted.
        self.route_request(&embedded, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decode() {
        let data = [0x0E, 0x02, 0x20, 0x01, 0x24, 0x01, 0xAA, 0xBB];
        let request = MessageRouterRequest::decode(&data).unwrap();
        assert_eq!(request.service, 0x0E);
        assert_eq!(request.path.class_id, 1);
        assert_eq!(request.path.instance_id, 1);
        assert_eq!(request.data, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_response_encoding() {
        let mut buf = Vec::new();
        MessageRouterResponse {
            reply_service: 0x8E,
            general_status: GeneralStatus::CONNECTION_FAILURE,
            additional_status: vec![0x0100],
            data: vec![0x01],
        }
        .encode(&mut buf);
        assert_eq!(buf, [0x8E, 0x00, 0x01, 0x01, 0x00, 0x01, 0x01]);
    }

    #[test]
    fn test_success_helper_sets_reply_flag() {
        let response = MessageRouterResponse::success(0x0E, vec![1]);
        assert_eq!(response.reply_service, 0x8E);
        assert_eq!(response.general_status, GeneralStatus::SUCCESS);
    }
}
