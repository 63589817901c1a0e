//! Token authentication.

use subtle::ConstantTimeEq;

use crate::{config::InstanceConfig, error::ProxyError};

/// Check the presented token against the instance's token set.
///
/// An empty token set means the instance requires no authentication. When
/// tokens are configured, every one of them is compared in constant time and
/// the verdicts are OR-ed, so timing reveals neither which token matched nor
/// how far a comparison got.
pub fn authorize(instance: &InstanceConfig, presented: Option<&str>) -> Result<(), ProxyError> {
    if instance.tokens.is_empty() {
        return Ok(());
    }
    let Some(presented) = presented else {
        return Err(ProxyError::Unauthorized);
    };
    let mut matched = 0u8;
    for token in &instance.tokens {
        matched |= presented.as_bytes().ct_eq(token.as_bytes()).unwrap_u8();
    }
    if matched == 1 {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}
