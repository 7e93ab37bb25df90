use crate::storage::RemoteEntry;
use regex::Regex;
use tracing::debug;

/// 远端文件名通配符（`*` 匹配任意字符串，`?` 匹配单个字符）
#[derive(Debug, Clone)]
pub struct NamePattern {
    pattern: String,
    regex: Regex,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = if pattern.trim().is_empty() {
            "*"
        } else {
            pattern.trim()
        };

        let mut regex_pattern = String::with_capacity(pattern.len() + 8);
        regex_pattern.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => regex_pattern.push_str(".*"),
                '?' => regex_pattern.push('.'),
                other => regex_pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        regex_pattern.push('$');

        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(&regex_pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }
}

/// 列表条目是否为需要处理的普通文件
pub fn is_candidate(entry: &RemoteEntry) -> bool {
    !(entry.file_name == "." || entry.file_name == ".." || entry.is_dir)
}

/// 按通配符过滤并排除目录，保持远端列表顺序
pub fn filter_listing(entries: Vec<RemoteEntry>, pattern: &NamePattern) -> Vec<RemoteEntry> {
    let total = entries.len();
    let mut dir_count = 0usize;
    let files: Vec<RemoteEntry> = entries
        .into_iter()
        .filter(|e| {
            if !is_candidate(e) {
                dir_count += 1;
                return false;
            }
            pattern.matches(&e.file_name)
        })
        .collect();

    debug!(
        "过滤远端列表: 共 {} 项, {} 个目录, {} 个文件匹配 '{}'",
        total,
        dir_count,
        files.len(),
        pattern.as_str()
    );
    files
}
