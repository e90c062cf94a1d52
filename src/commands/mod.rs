// 命令模块
// 提供供应用外壳调用的命令接口

pub mod content;

pub use content::{
    analyze_preferences,
    generate_quiz,
    import_document,
    init_model,
    list_topics,
    model_status,
    record_swipe,
    shutdown_model,
    ContentState,
    FactDto,
    ImportResultDto,
    ModelStatusDto,
    QuizDto,
};
