pub mod attachment_uploader;
pub mod composer;
pub mod conversation_directory;
pub mod message_stream;
pub mod read_state;

pub use attachment_uploader::{AttachmentUploader, LocalFile};
pub use composer::Composer;
pub use conversation_directory::{ConversationDirectory, DirectoryUpdate};
pub use message_stream::{MessageStream, StreamUpdate};
pub use read_state::{MarkRead, ReadStateTracker};
