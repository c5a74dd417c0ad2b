//! Spawning for background work that must never take the process down.

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawns `fut` on the runtime, catching and logging any panic inside it.
/// Callers may drop the handle; the task runs to completion regardless.
pub fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(task = name, "Background task started");
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(()) => debug!(task = name, "Background task finished"),
            Err(payload) => error!(task = name, "Background task panicked: {}", panic_message(payload.as_ref())),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_panic_is_contained() {
        let handle = spawn_supervised("explodes", async {
            panic!("boom");
        });
        // the join handle resolves normally because the panic was caught
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_completes_normally() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        spawn_supervised("quiet", async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
