//! Adapters - one per distinct method signature, cached for the bridge's life
//!
//! An adapter pairs the native parameter list of a signature with its
//! conversion plan. Invoking it runs the plan around an implementation.

use super::abi::{type_encoding, AbiSignature};
use super::marshal::{ConversionPlan, Marshaler};
use super::types::{CallFrame, ManagedValue, MethodSignature};
use crate::errors::{BridgeError, ErrorKind, Result};
use crate::logging::log_adapter_generated;
use crate::object::Selector;
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The managed implementation behind a native method
pub type Implementation = Arc<dyn Fn(&mut CallFrame) -> Result<ManagedValue> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    signature: MethodSignature,
    abi: AbiSignature,
    plan: ConversionPlan,
    encoding: String,
}

impl Adapter {
    pub fn generate(signature: &MethodSignature) -> Result<Self> {
        let plan = ConversionPlan::generate(signature)?;
        Ok(Self {
            signature: signature.clone(),
            abi: AbiSignature::for_method(signature),
            plan,
            encoding: type_encoding(signature),
        })
    }

    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn abi(&self) -> &AbiSignature {
        &self.abi
    }

    pub fn plan(&self) -> &ConversionPlan {
        &self.plan
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Run `imp` for one native call
    ///
    /// `words` is the full native parameter list, leading parameters
    /// included. Instance receivers are resolved as `declaring`.
    pub fn invoke(
        &self,
        marshaler: &Marshaler<'_>,
        declaring: TypeId,
        imp: &Implementation,
        words: &[usize],
    ) -> Result<usize> {
        if words.len() != self.abi.params.len() {
            return Err(ErrorKind::ArgumentCount {
                expected: self.abi.params.len(),
                found: words.len(),
            }
            .into());
        }

        let (stret, words) = if self.plan.is_stret() {
            (words[0], &words[1..])
        } else {
            (0, words)
        };
        let receiver = marshaler.receiver(words[0], self.plan.is_static(), declaring)?;
        let selector = Selector::new(words[1]).ok_or_else(|| BridgeError::null_argument("selector"))?;
        let declared = &words[2..];

        let args = marshaler.inbound(&self.plan, declared)?;
        let mut frame = CallFrame {
            receiver,
            selector,
            args,
        };
        let result = imp(&mut frame)?;

        marshaler.outbound(&self.plan, declared, &frame.args)?;
        marshaler.return_word(&self.plan, stret, result)
    }
}

/// Signature-keyed adapter cache
///
/// Two threads may generate the same adapter at once; the cache keeps
/// whichever lands first and the other is dropped.
#[derive(Default)]
pub struct AdapterFactory {
    cache: DashMap<MethodSignature, Arc<Adapter>>,
    generated: AtomicUsize,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter_for(&self, signature: &MethodSignature) -> Result<Arc<Adapter>> {
        if let Some(adapter) = self.cache.get(signature) {
            return Ok(Arc::clone(adapter.value()));
        }

        let adapter = Arc::new(Adapter::generate(signature)?);
        self.generated.fetch_add(1, Ordering::Relaxed);
        log_adapter_generated(&signature.selector, adapter.encoding());

        let entry = self.cache.entry(signature.clone()).or_insert(adapter);
        Ok(Arc::clone(entry.value()))
    }

    /// Distinct signatures cached
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Adapters built, including ones lost to a concurrent generation
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }
}
