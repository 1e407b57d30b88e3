// Copyright (c) 2024 Alibaba Cloud
//
// SPDX-License-Identifier: Apache-2.0
//

use anyhow::Result;
use async_trait::async_trait;
use hyper::{Body, Method, Request, Response, StatusCode};
use key_broker::error::{Error, Result as BrokerResult};
use key_broker::policy::{KeyTransferPolicy, PolicyFilter};
use key_broker::KeyBroker;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::keys::{parse_id, read_body};
use crate::router::{header, query_params, require_json, segments, ApiHandler};

/// ROOT path for the key transfer policy API
pub const POLICIES_ROOT: &str = "/v1/key-transfer-policies";

pub struct PoliciesHandler {
    broker: Arc<KeyBroker>,
}

enum Reply {
    One(StatusCode, KeyTransferPolicy),
    Many(Vec<KeyTransferPolicy>),
    Deleted,
}

impl PoliciesHandler {
    pub fn new(broker: Arc<KeyBroker>) -> Self {
        Self { broker }
    }

    async fn read_policy(req: Request<Body>) -> BrokerResult<KeyTransferPolicy> {
        require_json(&req)?;
        KeyTransferPolicy::from_json(&read_body(req).await?)
    }

    async fn dispatch(&self, id: Option<Uuid>, req: Request<Body>) -> BrokerResult<Reply> {
        self.broker
            .authenticate(header(&req, hyper::header::AUTHORIZATION.as_str()))
            .await?;

        let method = req.method().clone();
        match (method, id) {
            (Method::POST, None) => {
                let policy = self.broker.create_policy(Self::read_policy(req).await?).await?;
                Ok(Reply::One(StatusCode::CREATED, policy))
            }
            (Method::GET, None) => {
                let filter = PolicyFilter::from_query(&query_params(&req))?;
                Ok(Reply::Many(self.broker.search_policies(&filter).await?))
            }
            (Method::GET, Some(id)) => {
                Ok(Reply::One(StatusCode::OK, self.broker.retrieve_policy(&id).await?))
            }
            (Method::PUT, Some(id)) => {
                let policy = self
                    .broker
                    .update_policy(&id, Self::read_policy(req).await?)
                    .await?;
                Ok(Reply::One(StatusCode::OK, policy))
            }
            (Method::DELETE, Some(id)) => {
                self.broker.delete_policy(&id).await?;
                Ok(Reply::Deleted)
            }
            (method, _) => Err(Error::Validation(format!("unsupported method {method}"))),
        }
    }
}

#[async_trait]
impl ApiHandler for PoliciesHandler {
    async fn handle_request(
        &self,
        _remote_addr: SocketAddr,
        url_path: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let id = match segments(url_path).as_slice() {
            [] => {
                if !matches!(*req.method(), Method::POST | Method::GET) {
                    return self.not_allowed();
                }
                None
            }
            [id] => {
                if !matches!(*req.method(), Method::GET | Method::PUT | Method::DELETE) {
                    return self.not_allowed();
                }
                match parse_id(id) {
                    Ok(id) => Some(id),
                    Err(e) => return self.error_response(&e),
                }
            }
            _ => return self.not_found(),
        };

        match self.dispatch(id, req).await {
            Ok(Reply::One(status, policy)) => self.json_response(status, &policy),
            Ok(Reply::Many(policies)) => self.json_response(StatusCode::OK, &policies),
            Ok(Reply::Deleted) => self.no_content(),
            Err(e) => self.error_response(&e),
        }
    }
}
