//! 模型结构化输出解析
//! 修复并解析模型给出的近似 JSON（未加引号的键、单引号、尾随逗号、前后缀说明文字）

use crate::models::QuizQuestion;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 选择题固定的选项数
pub const QUIZ_OPTION_COUNT: usize = 4;

/// 截取从第一个 `open` 到最后一个 `close` 的片段
pub fn extract_span(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..end + close.len_utf8()])
}

/// 构建候选集：原始片段在前，修复程度依次递增
pub fn repair_candidates(span: &str) -> Vec<String> {
    let mut candidates = vec![span.to_string()];

    let keyed = quote_bare_keys(span);
    push_distinct(&mut candidates, keyed.clone());

    let quoted = single_to_double_quotes(&keyed);
    push_distinct(&mut candidates, quoted.clone());

    let trimmed = remove_trailing_commas(&quoted);
    push_distinct(&mut candidates, trimmed);

    candidates
}

fn push_distinct(candidates: &mut Vec<String>, candidate: String) {
    if candidates.last() != Some(&candidate) {
        candidates.push(candidate);
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// 给对象中未加引号的键加上双引号，字符串内容保持不变
pub fn quote_bare_keys(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
                last_significant = Some(c);
            }
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            quote = Some(c);
            out.push(c);
            i += 1;
            continue;
        }

        if is_ident_start(c) && matches!(last_significant, Some('{') | Some(',')) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();

            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if chars.get(j) == Some(&':') {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            last_significant = ident.chars().last();
            continue;
        }

        if !c.is_whitespace() {
            last_significant = Some(c);
        }
        out.push(c);
        i += 1;
    }

    out
}

/// 单引号字符串改为双引号，转义其中的双引号与非法反斜杠
pub fn single_to_double_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 8);
    let mut chars = input.chars().peekable();
    let mut in_double = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_double {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_double = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_double = true;
                out.push(c);
            }
            '\'' => {
                out.push('"');
                while let Some(inner) = chars.next() {
                    match inner {
                        '\\' => match chars.peek().copied() {
                            Some('\'') => {
                                chars.next();
                                out.push('\'');
                            }
                            Some(next) if "\"\\/bfnrtu".contains(next) => {
                                chars.next();
                                out.push('\\');
                                out.push(next);
                            }
                            _ => out.push_str("\\\\"),
                        },
                        '"' => out.push_str("\\\""),
                        '\'' => break,
                        other => out.push(other),
                    }
                }
                out.push('"');
            }
            _ => out.push(c),
        }
    }

    out
}

/// 删除 `}` / `]` 之前的尾随逗号
pub fn remove_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// 解析一批选择题
///
/// 只保留题干非空且恰好 4 个有效选项的题目，答案下标夹到选项范围内，
/// 结果最多 `expected` 条。没有可用结果时返回空列表。
pub fn parse_quiz_batch(text: &str, expected: usize) -> Vec<QuizQuestion> {
    if expected == 0 {
        return Vec::new();
    }

    for (open, close) in [('[', ']'), ('{', '}')] {
        let Some(span) = extract_span(text, open, close) else {
            continue;
        };

        for candidate in repair_candidates(span) {
            let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
                continue;
            };
            let items = match value {
                Value::Array(items) => items,
                object @ Value::Object(_) => vec![object],
                _ => continue,
            };

            let questions: Vec<QuizQuestion> = items
                .iter()
                .filter_map(quiz_from_value)
                .take(expected)
                .collect();
            if !questions.is_empty() {
                return questions;
            }
        }
    }

    log::debug!("no usable quiz questions in model output ({} chars)", text.len());
    Vec::new()
}

fn quiz_from_value(value: &Value) -> Option<QuizQuestion> {
    let object = value.as_object()?;

    let question = object.get("question")?.as_str()?.trim();
    if question.is_empty() {
        return None;
    }

    let raw_options = object.get("options")?.as_array()?;
    if raw_options.len() != QUIZ_OPTION_COUNT {
        return None;
    }
    let options = raw_options
        .iter()
        .map(option_text)
        .collect::<Option<Vec<String>>>()?;

    let correct_answer = object
        .get("correct_answer")
        .or_else(|| object.get("correctAnswer"))
        .and_then(answer_index)
        .unwrap_or(0)
        .min(options.len() - 1);

    Some(QuizQuestion {
        question: question.to_string(),
        options,
        correct_answer,
    })
}

fn option_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn answer_index(value: &Value) -> Option<usize> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(if raw <= 0.0 { 0 } else { raw.floor() as usize })
}

/// 解析第一个符合 `T` 结构的 JSON 对象，字段不做逐项修复
pub fn parse_json_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    let span = extract_span(text, '{', '}')?;
    repair_candidates(span)
        .iter()
        .find_map(|candidate| serde_json::from_str::<T>(candidate).ok())
}
