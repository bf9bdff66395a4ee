//! Unique request id policy: tags each request with `x-ms-client-request-id`
//! so client and service logs can be correlated.

use std::sync::Arc;

use uuid::Uuid;

use super::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::context::Context;
use crate::request::{Request, Response};
use crate::Result;

pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

pub(crate) fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Sets the id only when the caller has not.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniqueRequestIdPolicyFactory;

impl PolicyFactory for UniqueRequestIdPolicyFactory {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(UniqueRequestIdPolicy { next })
    }

    fn name(&self) -> &str {
        "unique_request_id"
    }
}

struct UniqueRequestIdPolicy {
    next: PolicyRef,
}

#[async_trait::async_trait]
impl Policy for UniqueRequestIdPolicy {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        if !request.headers.contains_key(CLIENT_REQUEST_ID_HEADER) {
            request.set_header(CLIENT_REQUEST_ID_HEADER, &new_request_id())?;
            request.generated_request_id = true;
        }
        self.next.send(ctx, request).await
    }
}
