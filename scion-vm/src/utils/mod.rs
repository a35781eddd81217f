//! Scion 虚拟机通用工具。

pub mod pool;

const MAX_SUMMARY_LEN: usize = 120; // 单行描述的最大长度

/// 截断过长的单行描述，用于栈快照与日志输出。
pub fn truncate_summary(text: &str) -> String {
    if text.chars().count() > MAX_SUMMARY_LEN {
        let mut truncated: String = text.chars().take(MAX_SUMMARY_LEN).collect();
        truncated.push_str("...");
        truncated
    } else {
        text.to_string()
    }
}
