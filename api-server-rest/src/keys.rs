// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use hyper::{body, Body, Method, Request, Response, StatusCode};
use key_broker::error::Error;
use key_broker::keys::{KeyFilter, KeyRequest, KeyResponse};
use key_broker::{KeyBroker, TransferHeaders, TransferOutcome, TransferRequest};
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::router::{
    accepts_json, content_type, header, header_value, is_method, query_params, require_json,
    segments, ApiHandler, JSON_CONTENT_TYPE,
};

/// ROOT path for the key API
pub const KEYS_ROOT: &str = "/v1/keys";

const SAML_CONTENT_TYPE: &str = "application/samlassertion+xml";
const PUBLIC_KEY_CONTENT_TYPE: &str = "text/plain";

pub const NONCE_HEADER: &str = "Nonce";
pub const ATTESTATION_TYPE_HEADER: &str = "Attestation-Type";

pub struct KeysHandler {
    broker: Arc<KeyBroker>,
}

pub(crate) fn parse_id(value: &str) -> key_broker::error::Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| Error::Validation(format!("invalid id: {value}")))
}

pub(crate) async fn read_body(req: Request<Body>) -> key_broker::error::Result<Vec<u8>> {
    body::to_bytes(req.into_body())
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|e| Error::Validation(format!("failed to read request body: {e}")))
}

fn read_text(bytes: Vec<u8>) -> key_broker::error::Result<String> {
    String::from_utf8(bytes).map_err(|_| Error::Validation("request body is not UTF-8".to_string()))
}

enum Reply {
    Json(StatusCode, serde_json::Value),
    NoContent,
    Challenge {
        nonce: String,
        attestation_type: String,
    },
}

impl KeysHandler {
    pub fn new(broker: Arc<KeyBroker>) -> Self {
        Self { broker }
    }

    async fn authenticate(&self, req: &Request<Body>) -> key_broker::error::Result<()> {
        self.broker
            .authenticate(header(req, hyper::header::AUTHORIZATION.as_str()))
            .await
            .map(|_| ())
    }

    async fn create(&self, req: Request<Body>) -> key_broker::error::Result<Reply> {
        self.authenticate(&req).await?;
        require_json(&req)?;
        let request = KeyRequest::from_json(&read_body(req).await?)?;

        let key = if request.is_registration() {
            self.broker.register_key(&request).await?
        } else {
            self.broker.create_key(&request).await?
        };
        Ok(Reply::Json(StatusCode::CREATED, to_value(KeyResponse::from(&key))?))
    }

    async fn search(&self, req: Request<Body>) -> key_broker::error::Result<Reply> {
        self.authenticate(&req).await?;
        let filter = KeyFilter::from_query(&query_params(&req))?;
        let keys: Vec<KeyResponse> = self
            .broker
            .search_keys(&filter)
            .await?
            .iter()
            .map(KeyResponse::from)
            .collect();
        Ok(Reply::Json(StatusCode::OK, to_value(keys)?))
    }

    async fn retrieve(&self, id: &Uuid, req: Request<Body>) -> key_broker::error::Result<Reply> {
        self.authenticate(&req).await?;
        let key = self.broker.retrieve_key(id).await?;
        Ok(Reply::Json(StatusCode::OK, to_value(KeyResponse::from(&key))?))
    }

    async fn delete(&self, id: &Uuid, req: Request<Body>) -> key_broker::error::Result<Reply> {
        self.authenticate(&req).await?;
        self.broker.delete_key(id).await?;
        Ok(Reply::NoContent)
    }

    async fn transfer(&self, id: &Uuid, req: Request<Body>) -> key_broker::error::Result<Reply> {
        if !accepts_json(&req) {
            return Err(Error::UnsupportedMediaType(format!(
                "transfer responses are {JSON_CONTENT_TYPE}"
            )));
        }

        let authorization = header(&req, hyper::header::AUTHORIZATION.as_str()).map(str::to_string);
        match content_type(&req).as_deref() {
            None | Some(JSON_CONTENT_TYPE) => {
                let headers = TransferHeaders {
                    authorization,
                    attestation_type: header(&req, ATTESTATION_TYPE_HEADER).map(str::to_string),
                    nonce: header(&req, NONCE_HEADER).map(str::to_string),
                };
                let request = TransferRequest::from_json(&read_body(req).await?)?;
                match self.broker.transfer_with_token(id, &request, &headers).await? {
                    TransferOutcome::Challenge {
                        nonce,
                        attestation_type,
                    } => Ok(Reply::Challenge {
                        nonce,
                        attestation_type: attestation_type.to_string(),
                    }),
                    TransferOutcome::Released(response) => {
                        Ok(Reply::Json(StatusCode::OK, to_value(response)?))
                    }
                }
            }
            Some(SAML_CONTENT_TYPE) => {
                let xml = read_text(read_body(req).await?)?;
                let response = self.broker.transfer_with_saml(id, &xml).await?;
                Ok(Reply::Json(StatusCode::OK, to_value(response)?))
            }
            Some(PUBLIC_KEY_CONTENT_TYPE) => {
                let pem = read_text(read_body(req).await?)?;
                let response = self
                    .broker
                    .transfer_with_public_key(id, &pem, authorization.as_deref())
                    .await?;
                Ok(Reply::Json(StatusCode::OK, to_value(response)?))
            }
            Some(other) => Err(Error::UnsupportedMediaType(other.to_string())),
        }
    }

    fn reply(&self, reply: key_broker::error::Result<Reply>) -> Result<Response<Body>> {
        match reply {
            Ok(Reply::Json(status, body)) => self.json_response(status, &body),
            Ok(Reply::NoContent) => self.no_content(),
            Ok(Reply::Challenge {
                nonce,
                attestation_type,
            }) => {
                let mut response =
                    self.message_response(StatusCode::UNAUTHORIZED, "attestation required")?;
                let headers = response.headers_mut();
                headers.insert(NONCE_HEADER, header_value(&nonce)?);
                headers.insert(ATTESTATION_TYPE_HEADER, header_value(&attestation_type)?);
                Ok(response)
            }
            Err(e) => self.error_response(&e),
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> key_broker::error::Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::internal("encode response", e))
}

#[async_trait]
impl ApiHandler for KeysHandler {
    async fn handle_request(
        &self,
        _remote_addr: SocketAddr,
        url_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let segments = segments(url_path);
        let reply = match segments.as_slice() {
            [] => match *req.method() {
                Method::POST => self.create(req).await,
                Method::GET => self.search(req).await,
                _ => return self.not_allowed(),
            },
            [id] => {
                if !is_method(&req, &[Method::GET, Method::DELETE]) {
                    return self.not_allowed();
                }
                let id = match parse_id(id) {
                    Ok(id) => id,
                    Err(e) => return self.error_response(&e),
                };
                if req.method() == Method::GET {
                    self.retrieve(&id, req).await
                } else {
                    self.delete(&id, req).await
                }
            }
            [id, "transfer"] => {
                if req.method() != Method::POST {
                    return self.not_allowed();
                }
                match parse_id(id) {
                    Ok(id) => self.transfer(&id, req).await,
                    Err(e) => Err(e),
                }
            }
            _ => return self.not_found(),
        };

        self.reply(reply)
    }
}
