// Copyright 2020 Joyent, Inc.

//! Thin wrappers for common RPCs. These only marshal arguments and check the
//! shape of the response; everything else is up to the connection.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::client::Client;
use crate::connection::Connection;
use crate::error::{Error, ResponseShape};
use crate::stream::RpcStream;

/// Per-request options understood by the remote end. Unset fields are left
/// out of the request entirely.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_null_values: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: u32,
}

/// Require exactly one response message.
pub fn expect_one(method: &str, mut messages: Vec<Value>) -> Result<Value, Error> {
    match messages.len() {
        1 => Ok(messages.remove(0)),
        received => Err(Error::ResponseShape {
            method: method.to_string(),
            expected: ResponseShape::ExactlyOne,
            received,
        }),
    }
}

/// Require zero or one response messages.
pub fn expect_at_most_one(
    method: &str,
    mut messages: Vec<Value>,
) -> Result<Option<Value>, Error> {
    match messages.len() {
        0 => Ok(None),
        1 => Ok(Some(messages.remove(0))),
        received => Err(Error::ResponseShape {
            method: method.to_string(),
            expected: ResponseShape::AtMostOne,
            received,
        }),
    }
}

impl<C> Client<C>
where
    C: Connection,
{
    pub async fn ping(&self, opts: &RequestOptions) -> Result<(), Error> {
        let messages = self.rpc("ping", vec![serde_json::to_value(opts)?]).await?;
        expect_at_most_one("ping", messages).map(|_| ())
    }

    /// The protocol version spoken by a backend.
    pub async fn version(&self, opts: &RequestOptions) -> Result<u32, Error> {
        let messages =
            self.rpc("version", vec![serde_json::to_value(opts)?]).await?;
        let response: VersionResponse =
            serde_json::from_value(expect_one("version", messages)?)?;
        Ok(response.version)
    }

    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &RequestOptions,
    ) -> Result<Value, Error> {
        let args = vec![json!(bucket), json!(key), serde_json::to_value(opts)?];
        let messages = self.rpc("getObject", args).await?;
        expect_one("getObject", messages)
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        opts: &RequestOptions,
    ) -> Result<Value, Error> {
        let args = vec![
            json!(bucket),
            json!(key),
            value.clone(),
            serde_json::to_value(opts)?,
        ];
        let messages = self.rpc("putObject", args).await?;
        expect_one("putObject", messages)
    }

    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &RequestOptions,
    ) -> Result<(), Error> {
        let args = vec![json!(bucket), json!(key), serde_json::to_value(opts)?];
        let messages = self.rpc("delObject", args).await?;
        expect_at_most_one("delObject", messages).map(|_| ())
    }

    /// Stream every object in `bucket` matching `filter`.
    pub fn find_objects(
        &self,
        bucket: &str,
        filter: &str,
        opts: &RequestOptions,
    ) -> RpcStream<C> {
        let opts = match serde_json::to_value(opts) {
            Ok(opts) => opts,
            Err(err) => {
                return RpcStream::failed(self.clone(), "findObjects", err.into())
            }
        };
        self.rpc_stream("findObjects", vec![json!(bucket), json!(filter), opts])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_skip_unset_fields() {
        let opts = RequestOptions {
            req_id: Some(String::from("abc")),
            ignore_null_values: Some(true),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&opts).unwrap(),
            json!({"reqId": "abc", "ignoreNullValues": true})
        );
        assert_eq!(
            serde_json::to_value(&RequestOptions::default()).unwrap(),
            json!({})
        );
    }

    #[test]
    fn response_shapes() {
        assert_eq!(expect_one("m", vec![json!(1)]).unwrap(), json!(1));
        assert!(matches!(
            expect_one("m", vec![]),
            Err(Error::ResponseShape { received: 0, .. })
        ));
        assert!(matches!(
            expect_one("m", vec![json!(1), json!(2)]),
            Err(Error::ResponseShape {
                expected: ResponseShape::ExactlyOne,
                received: 2,
                ..
            })
        ));

        assert_eq!(expect_at_most_one("m", vec![]).unwrap(), None);
        assert_eq!(
            expect_at_most_one("m", vec![json!("x")]).unwrap(),
            Some(json!("x"))
        );
        assert!(matches!(
            expect_at_most_one("m", vec![json!(1), json!(2)]),
            Err(Error::ResponseShape {
                expected: ResponseShape::AtMostOne,
                ..
            })
        ));
    }
}
