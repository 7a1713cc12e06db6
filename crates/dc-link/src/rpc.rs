use std::future::Future;

use dc_core::RpcResponse;
use serde::de::DeserializeOwned;

use crate::error::LinkError;

/// Awaits a backend call and unwraps its `{success, data, msg}` envelope.
/// `success: false` becomes `LinkError::Rpc` carrying the backend message;
/// transport failures from the call itself pass through unchanged.
pub async fn call<T, F>(request: F) -> Result<T, LinkError>
where
    T: DeserializeOwned,
    F: Future<Output = Result<RpcResponse, LinkError>>,
{
    let response = request.await?;
    Ok(response.into_data()?)
}

/// Like `call` for endpoints whose payload is not interesting.
pub async fn call_unit<F>(request: F) -> Result<(), LinkError>
where
    F: Future<Output = Result<RpcResponse, LinkError>>,
{
    request.await?.into_value()?;
    Ok(())
}
