// 服务模块
// 模型生命周期、内容生成管线与存储

pub mod backend;
pub mod database;
pub mod events;
pub mod extraction;
pub mod lifecycle;
pub mod llama;
pub mod output_parser;
pub mod preference;
pub mod prompts;
pub mod quiz;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{
    Capability,
    ChatMessage,
    CompletionOptions,
    CompletionRequest,
    CompletionResult,
    ModelBackend,
    ModelRuntime,
    NoBackend,
};

pub use database::{
    DatabaseService,
    StoredInteraction,
    TopicSummary,
};

pub use events::{
    ProgressBus,
    ProgressEvent,
    Subscription,
};

pub use extraction::FactExtractor;

pub use lifecycle::{
    ModelLifecycle,
    ModelState,
    strip_thinking,
};

pub use llama::{
    LlamaRuntime,
    LlamaSidecar,
    build_chat_prompt,
    build_server_args,
    get_platform_binary_name,
};

pub use output_parser::{
    parse_json_object,
    parse_quiz_batch,
};

pub use preference::{
    PreferenceAnalyzer,
    SwipeCounts,
};

pub use quiz::QuizGenerator;
