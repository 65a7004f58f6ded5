use comms::{PsError, node::NodeRole};
use log::{error, info};
use tokio::signal;

use node::Node;

#[tokio::main]
async fn main() -> Result<(), PsError> {
    env_logger::init();

    let mut node = Node::from_env()?;
    info!("starting {}", node.info());

    if node.is_worker() {
        return Err(PsError::Config(
            "workers are driven by the training program, embed the node crate instead".into(),
        ));
    }

    node.init().await?;

    let ret = tokio::select! {
        ret = run(&mut node) => ret,
        _ = signal::ctrl_c() => {
            info!("received SIGINT");
            Ok(())
        }
    };

    if let Err(e) = &ret {
        error!("{} stopped: {e}", node.info().role);
    }

    node.finalize().await?;
    ret
}

async fn run(node: &mut Node) -> Result<(), PsError> {
    match node.info().role {
        NodeRole::Scheduler => node.coordinate().await,
        _ => node.serve().await,
    }
}
