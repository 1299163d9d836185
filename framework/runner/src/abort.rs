use squall_core::prelude::StopHandle;
use tokio::signal;

/// Listen for Ctrl-C and turn it into a stop signal.
///
/// The returned handle gains a listener per in-flight run so that an abort tears the active run
/// down before the process unwinds, leaving no workload behind.
pub fn start_abort_listener() -> StopHandle {
    let handle = StopHandle::default();

    let listener_handle = handle.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                listener_handle.stop();
                println!("Received abort signal, winding down...");
            }
            Err(e) => {
                log::error!("Failed to listen for Ctrl-C: {e}");
            }
        }
    });

    handle
}
