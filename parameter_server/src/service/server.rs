use comms::{Result, transport::Inbox};

/// This trait acts as an indirection layer, allowing the `ServerBuilder` to return
/// different `ParameterServer` configurations from its unique build method.
#[async_trait::async_trait]
pub trait Server: Send {
    /// Indirection method for `ParameterServer::serve`.
    ///
    /// # Arguments
    /// * `inbox` - Where every link of this node delivers its messages.
    async fn serve(&mut self, inbox: &mut Inbox) -> Result<()>;

    /// The amount of pulls currently held back by the consistency policy.
    fn deferred(&self) -> usize;
}
