// 数据库服务模块
// 基于 SQLite 保存事实、选择题和滑动记录

use crate::error::Result;
use crate::models::{Fact, Interaction, QuizQuestion, SwipeDirection};
use crate::services::events::{ProgressBus, ProgressEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// 主题统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic: String,
    pub fact_count: usize,
}

/// 已保存的滑动记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInteraction {
    pub id: i64,
    pub fact_id: i64,
    pub topic: String,
    pub direction: SwipeDirection,
    pub created_at: DateTime<Utc>,
}

impl From<StoredInteraction> for Interaction {
    fn from(value: StoredInteraction) -> Self {
        Interaction::new(value.direction)
    }
}

/// 数据库服务
pub struct DatabaseService {
    conn: Mutex<Connection>,
    bus: ProgressBus,
}

impl DatabaseService {
    /// 打开数据库文件，必要时创建所在目录
    pub fn open(path: &Path, bus: ProgressBus) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        log::info!("opening database at {}", path.display());
        Self::with_connection(Connection::open(path)?, bus)
    }

    pub fn open_in_memory(bus: ProgressBus) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, bus)
    }

    fn with_connection(conn: Connection, bus: ProgressBus) -> Result<Self> {
        let service = Self {
            conn: Mutex::new(conn),
            bus,
        };
        service.initialize()?;
        Ok(service)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 初始化表结构
    fn initialize(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                content_key TEXT NOT NULL,
                topic TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (topic, content_key)
            );

            CREATE TABLE IF NOT EXISTS quiz_questions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                question TEXT NOT NULL,
                options TEXT NOT NULL,
                correct_answer INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fact_id INTEGER NOT NULL,
                direction TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (fact_id) REFERENCES facts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_facts_topic ON facts(topic);
            CREATE INDEX IF NOT EXISTS idx_quiz_questions_topic ON quiz_questions(topic);
            CREATE INDEX IF NOT EXISTS idx_interactions_fact_id ON interactions(fact_id);",
        )?;
        Ok(())
    }

    // ==================== 事实 ====================

    /// 保存事实并分配 id
    ///
    /// 同一主题下内容（忽略大小写）重复的事实会被跳过，返回实际写入的事实。
    /// 事务提交并释放连接后才发出进度事件，每个主题一条完成事件。
    pub fn save_facts(&self, facts: &[Fact]) -> Result<Vec<Fact>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }
        let total = facts.len();

        let mut saved = Vec::with_capacity(total);
        let mut progress = Vec::with_capacity(total);
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO facts (content, content_key, topic, source, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )?;

                for fact in facts {
                    let inserted = stmt.execute(params![
                        fact.content,
                        fact.content.to_lowercase(),
                        fact.topic,
                        fact.source,
                        fact.created_at,
                    ])?;
                    if inserted > 0 {
                        saved.push(Fact {
                            id: tx.last_insert_rowid(),
                            ..fact.clone()
                        });
                    }
                    progress.push((fact.topic.as_str(), saved.len()));
                }
            }
            tx.commit()?;
        }

        let mut per_topic: Vec<(&str, usize)> = Vec::new();
        for (topic, count) in progress {
            self.bus.emit(ProgressEvent::StorageSaveProgress {
                topic: topic.to_string(),
                saved: count,
                total,
            });
            if !per_topic.iter().any(|(t, _)| *t == topic) {
                per_topic.push((topic, 0));
            }
        }
        for fact in &saved {
            if let Some(entry) = per_topic.iter_mut().find(|(t, _)| *t == fact.topic) {
                entry.1 += 1;
            }
        }
        for (topic, count) in per_topic {
            self.bus.emit(ProgressEvent::StorageSaveComplete {
                topic: topic.to_string(),
                saved: count,
            });
        }
        log::info!("saved {} of {} fact(s)", saved.len(), total);

        Ok(saved)
    }

    pub fn get_facts_by_topic(&self, topic: &str) -> Result<Vec<Fact>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, topic, source, created_at
             FROM facts WHERE topic = ? ORDER BY id",
        )?;

        let rows = stmt.query_map(params![topic], Self::row_to_fact)?;
        let facts = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(facts)
    }

    pub fn get_fact(&self, id: i64) -> Result<Option<Fact>> {
        let conn = self.lock();
        let fact = conn
            .query_row(
                "SELECT id, content, topic, source, created_at FROM facts WHERE id = ?",
                params![id],
                Self::row_to_fact,
            )
            .optional()?;
        Ok(fact)
    }

    /// 所有主题及事实数，按主题名排序
    pub fn list_topics(&self) -> Result<Vec<TopicSummary>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT topic, COUNT(*) FROM facts GROUP BY topic ORDER BY topic")?;

        let rows = stmt.query_map([], |row| {
            Ok(TopicSummary {
                topic: row.get(0)?,
                fact_count: row.get::<_, i64>(1)? as usize,
            })
        })?;
        let topics = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(topics)
    }

    // ==================== 选择题 ====================

    pub fn save_quiz_questions(&self, topic: &str, questions: &[QuizQuestion]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO quiz_questions (topic, question, options, correct_answer, created_at)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            let now = Utc::now();
            for question in questions {
                stmt.execute(params![
                    topic,
                    question.question,
                    serde_json::to_string(&question.options)?,
                    question.correct_answer as i64,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        Ok(questions.len())
    }

    pub fn get_quiz_questions(&self, topic: &str) -> Result<Vec<QuizQuestion>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT question, options, correct_answer
             FROM quiz_questions WHERE topic = ? ORDER BY id",
        )?;

        let rows = stmt.query_map(params![topic], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut questions = Vec::new();
        for row in rows {
            let (question, options, correct_answer) = row?;
            questions.push(QuizQuestion {
                question,
                options: serde_json::from_str(&options)?,
                correct_answer: correct_answer.max(0) as usize,
            });
        }
        Ok(questions)
    }

    // ==================== 滑动记录 ====================

    /// 记录一次滑动，事实不存在时返回存储错误
    pub fn record_interaction(&self, fact_id: i64, direction: &SwipeDirection) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO interactions (fact_id, direction, created_at) VALUES (?, ?, ?)",
            params![fact_id, direction.to_string(), Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// 最近的滑动记录，新的在前
    pub fn recent_interactions(&self, limit: usize) -> Result<Vec<StoredInteraction>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT i.id, i.fact_id, f.topic, i.direction, i.created_at
             FROM interactions i JOIN facts f ON f.id = i.fact_id
             ORDER BY i.id DESC LIMIT ?",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok(StoredInteraction {
                id: row.get(0)?,
                fact_id: row.get(1)?,
                topic: row.get(2)?,
                direction: SwipeDirection::from(row.get::<_, String>(3)?),
                created_at: row.get(4)?,
            })
        })?;
        let interactions = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(interactions)
    }

    // ==================== 辅助方法 ====================

    fn row_to_fact(row: &Row) -> rusqlite::Result<Fact> {
        Ok(Fact {
            id: row.get(0)?,
            content: row.get(1)?,
            topic: row.get(2)?,
            source: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}
