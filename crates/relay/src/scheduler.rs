use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `tick` every `period` until `token` is cancelled.
///
/// The first run happens one full period after spawning.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.reset();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(task = name, "periodic task stopped");
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}
