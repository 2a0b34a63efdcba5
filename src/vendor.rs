/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `RenderVendor`: a registry of worker renderers sharing one port range.

use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};

use crate::renderer::Renderer;
use crate::types::{RendererError, WorkerOptions};

/// First port handed out.
pub const BASE_PORT: u16 = WorkerOptions::DEFAULT_PORT;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates worker renderers on consecutive ports and tears them down
/// together. Also holds the shared renderer for callers that do not manage
/// their own, created on first use.
pub struct RenderVendor {
    defaults: WorkerOptions,
    next_port: Mutex<u16>,
    renderers: Mutex<Vec<Renderer>>,
    shared: Mutex<Option<Renderer>>,
}

impl RenderVendor {
    /// `defaults` applies to every renderer; its port is ignored.
    pub fn new(defaults: WorkerOptions) -> Self {
        Self {
            defaults,
            next_port: Mutex::new(BASE_PORT),
            renderers: Mutex::new(Vec::new()),
            shared: Mutex::new(None),
        }
    }

    /// Create a renderer on the next free port.
    pub fn create(&self) -> Result<Renderer, RendererError> {
        let port = *lock(&self.next_port);
        self.create_on(port)
    }

    /// Create a renderer on `port`. Taking the next free port advances it.
    pub fn create_on(&self, port: u16) -> Result<Renderer, RendererError> {
        let renderer = Renderer::worker(WorkerOptions {
            port,
            ..self.defaults.clone()
        })?;

        {
            let mut next = lock(&self.next_port);
            if *next == port {
                *next = port.wrapping_add(1);
            }
        }

        info!("created renderer on port {port}");
        lock(&self.renderers).push(renderer.clone());
        Ok(renderer)
    }

    /// Forget `renderer` and stop its worker.
    pub async fn destroy(&self, renderer: &Renderer) -> Result<(), RendererError> {
        lock(&self.renderers).retain(|r| !r.ptr_eq(renderer));
        {
            let mut shared = lock(&self.shared);
            if shared.as_ref().is_some_and(|r| r.ptr_eq(renderer)) {
                *shared = None;
            }
        }

        if renderer.is_booted() {
            renderer.destroy().await
        } else {
            renderer.shutdown().await
        }
    }

    pub fn renderers(&self) -> Vec<Renderer> {
        lock(&self.renderers).clone()
    }

    /// Destroy every renderer and start handing out ports from the base
    /// again. All renderers are destroyed even if some fail; the first
    /// failure is returned.
    pub async fn shutdown(&self) -> Result<(), RendererError> {
        let renderers = self.renderers();
        let mut result = Ok(());

        for renderer in &renderers {
            if let Err(err) = self.destroy(renderer).await {
                warn!("failed to destroy renderer: {err}");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        *lock(&self.next_port) = BASE_PORT;
        result
    }

    /// The shared renderer, created on first use.
    pub fn default_renderer(&self) -> Result<Renderer, RendererError> {
        if let Some(renderer) = lock(&self.shared).as_ref() {
            return Ok(renderer.clone());
        }

        let renderer = self.create()?;
        let mut shared = lock(&self.shared);
        // Another caller may have won the race; keep theirs.
        match shared.as_ref() {
            Some(existing) => {
                let existing = existing.clone();
                drop(shared);
                lock(&self.renderers).retain(|r| !r.ptr_eq(&renderer));
                Ok(existing)
            }
            None => {
                *shared = Some(renderer.clone());
                Ok(renderer)
            }
        }
    }

    pub fn set_default_renderer(&self, renderer: Renderer) {
        *lock(&self.shared) = Some(renderer);
    }
}

impl Default for RenderVendor {
    fn default() -> Self {
        Self::new(WorkerOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use crate::renderer::RendererStatus;

    fn port_of(vendor: &RenderVendor) -> u16 {
        *lock(&vendor.next_port)
    }

    #[test]
    fn assigns_consecutive_ports() {
        let vendor = RenderVendor::default();
        vendor.create().unwrap();
        vendor.create().unwrap();
        assert_eq!(port_of(&vendor), BASE_PORT + 2);
        assert_eq!(vendor.renderers().len(), 2);
    }

    #[test]
    fn explicit_port_only_advances_when_next() {
        let vendor = RenderVendor::default();
        vendor.create_on(9000).unwrap();
        assert_eq!(port_of(&vendor), BASE_PORT);

        vendor.create_on(BASE_PORT).unwrap();
        assert_eq!(port_of(&vendor), BASE_PORT + 1);
    }

    #[tokio::test]
    async fn destroy_forgets_renderer() {
        let vendor = RenderVendor::default();
        let a = vendor.create().unwrap();
        let b = vendor.create().unwrap();

        vendor.destroy(&a).await.unwrap();

        let remaining = vendor.renderers();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].ptr_eq(&b));
        assert_eq!(a.status(), RendererStatus::Idle);
    }

    #[tokio::test]
    async fn shutdown_destroys_all_and_resets_ports() {
        let vendor = RenderVendor::default();
        vendor.create().unwrap();
        vendor.create().unwrap();

        vendor.shutdown().await.unwrap();

        assert!(vendor.renderers().is_empty());
        assert_eq!(port_of(&vendor), BASE_PORT);
        let fresh = vendor.create().unwrap();
        assert!(fresh.ptr_eq(&vendor.renderers()[0]));
        assert_eq!(port_of(&vendor), BASE_PORT + 1);
    }

    #[tokio::test]
    async fn shutdown_reports_first_failure() {
        let vendor = RenderVendor::default();
        let worker = vendor.create().unwrap();
        lock(&vendor.renderers).push(Renderer::new(NullBackend));

        let err = vendor.shutdown().await.unwrap_err();
        assert!(matches!(err, RendererError::NotImplemented("shutdown")));
        assert!(vendor.renderers().is_empty());
        assert_eq!(worker.status(), RendererStatus::Idle);
    }

    #[test]
    fn default_renderer_is_created_once() {
        let vendor = RenderVendor::default();
        let first = vendor.default_renderer().unwrap();
        let second = vendor.default_renderer().unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(vendor.renderers().len(), 1);
    }

    #[test]
    fn default_renderer_can_be_injected() {
        let vendor = RenderVendor::default();
        let custom = Renderer::new(NullBackend);
        vendor.set_default_renderer(custom.clone());

        assert!(vendor.default_renderer().unwrap().ptr_eq(&custom));
        assert!(vendor.renderers().is_empty());
    }
}
