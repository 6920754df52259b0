//! Per-call resource scope.
//!
//! One top-level completion exclusively owns an LM handler and an
//! environment. The scope bundles both so every exit path releases them:
//! `close` drains and shuts down in order, and plain `Drop` (cancellation)
//! aborts the handler's accept loop and kills environment children.

use std::sync::Arc;

use crate::environment::{Environment, create_environment, setup_code};
use crate::error::{Result, RlmError};
use crate::handler::LmHandler;
use crate::types::UsageSummary;

use super::{RecursiveRouter, Rlm};

enum EnvSlot<'a> {
    Owned(Box<dyn Environment>),
    Borrowed(&'a mut dyn Environment),
}

/// Handler + environment for the duration of one completion.
pub(crate) struct CallScope<'a> {
    handler: Option<LmHandler>,
    env: EnvSlot<'a>,
}

impl<'a> CallScope<'a> {
    /// Open a scope with a fresh environment built from the driver config.
    ///
    /// Runs `setup` and, when configured, the `setup_code` snippet; a
    /// failing snippet is fatal.
    pub async fn open(driver: &Rlm) -> Result<CallScope<'a>> {
        let handler = Self::bind_handler(driver).await?;
        let mut env = match create_environment(
            &driver.config.environment,
            &driver.config.environment_kwargs,
            handler.local_addr(),
        ) {
            Ok(env) => env,
            Err(e) => {
                let _ = handler.shutdown().await;
                return Err(e);
            }
        };

        if let Err(e) = Self::init_env(driver, env.as_mut()).await {
            let _ = env.teardown().await;
            let _ = handler.shutdown().await;
            return Err(e);
        }

        Ok(CallScope {
            handler: Some(handler),
            env: EnvSlot::Owned(env),
        })
    }

    /// Open a scope around a caller-owned (persistent) environment.
    ///
    /// The environment is rebound to this driver's fresh handler and set
    /// up if it was not already; it is NOT torn down on close.
    pub async fn open_with(driver: &Rlm, env: &'a mut dyn Environment) -> Result<CallScope<'a>> {
        let handler = Self::bind_handler(driver).await?;

        let prepared = async {
            env.update_handler_address(handler.local_addr()).await?;
            env.setup().await
        }
        .await;
        if let Err(e) = prepared {
            let _ = handler.shutdown().await;
            return Err(e);
        }

        Ok(CallScope {
            handler: Some(handler),
            env: EnvSlot::Borrowed(env),
        })
    }

    async fn bind_handler(driver: &Rlm) -> Result<LmHandler> {
        LmHandler::bind(Arc::new(RecursiveRouter::new(driver.subcall_driver()))).await
    }

    async fn init_env(driver: &Rlm, env: &mut dyn Environment) -> Result<()> {
        env.setup().await?;
        if let Some(code) = setup_code(&driver.config.environment_kwargs) {
            let result = env
                .execute_code(code)
                .await
                .map_err(|e| RlmError::Setup(e.to_string()))?;
            if result.is_err() {
                return Err(RlmError::Setup(result.stderr));
            }
        }
        Ok(())
    }

    pub fn handler(&self) -> &LmHandler {
        self.handler
            .as_ref()
            .expect("handler lives until the scope closes")
    }

    pub fn env(&mut self) -> &mut dyn Environment {
        match &mut self.env {
            EnvSlot::Owned(env) => env.as_mut(),
            EnvSlot::Borrowed(env) => *env,
        }
    }

    /// Release the handler and (owned) environment, returning the usage
    /// the handler aggregated from child calls. Teardown faults are
    /// logged, not raised: the completion result must survive them.
    pub async fn close(mut self) -> UsageSummary {
        let usage = self.handler().usage();

        if let EnvSlot::Owned(ref mut env) = self.env {
            if let Err(e) = env.teardown().await {
                tracing::warn!(error = %e, "environment teardown failed");
            }
        }
        if let Some(handler) = self.handler.take() {
            if let Err(e) = handler.shutdown().await {
                tracing::warn!(error = %e, "handler shutdown failed");
            }
        }
        usage
    }
}
