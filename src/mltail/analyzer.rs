//! 条目解析器：把原始字节解析为 (发言者, 分类, 消息)

use crate::mlcommon::error::{AppError, Result};
use crate::mlcommon::models::category;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub actor: String,
    pub category: String,
    pub message: String,
}

pub trait Analyzer: Send + Sync {
    fn name(&self) -> &'static str;

    /// 无法识别时返回错误，由调用方转为 unparsed 记录
    fn analyze(&self, bytes: &[u8]) -> Result<Analysis>;
}

fn decode_utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| AppError::ParseError(format!("条目不是有效的 UTF-8: {}", e)))
}

/// 整条文本即消息
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAnalyzer;

impl Analyzer for PlainAnalyzer {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn analyze(&self, bytes: &[u8]) -> Result<Analysis> {
        let text = decode_utf8(bytes)?.trim();
        if text.is_empty() {
            return Err(AppError::ParseError("空条目".to_string()));
        }
        Ok(Analysis {
            actor: String::new(),
            category: category::TEXT.to_string(),
            message: text.to_string(),
        })
    }
}

static ENTRY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    // 格式固定，编译失败只可能是代码错误
    Regex::new(r"(?s)^([0-9A-F]{4}):([^:]*):(.*)$").unwrap_or_else(|e| panic!("invalid entry pattern: {}", e))
});

/// 频道代码到分类名
static CHANNEL_CATEGORIES: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(0x01, "say");
    table.insert(0x02, "shout");
    table.insert(0x03, "tell");
    table.insert(0x04, "party");
    // 0x0D 为自己发出的私聊
    table.insert(0x0D, "tell");
    for code in (0x05..=0x0C).chain(0x0E..=0x15) {
        table.insert(code, "linkshell");
    }
    table.insert(0x1B, "emote");
    for code in [0x1D, 0x20, 0x21] {
        table.insert(code, "system");
    }
    for code in [0x23, 0x26, 0x28] {
        table.insert(code, "npc");
    }
    table.insert(0x42, "gain");
    table.insert(0x43, "gain");
    table.insert(0x44, "defeat");
    table.insert(0x45, "defeat");
    for code in [0x50, 0x51, 0x52, 0x53, 0x54, 0x55, 0x56, 0x58, 0x59, 0x5B, 0x5C, 0x5E, 0x61] {
        table.insert(code, "battle");
    }
    for code in [0x62, 0x64, 0x66, 0x67, 0x68, 0x69, 0x6A, 0x6B, 0x6C, 0x6D] {
        table.insert(code, "effect");
    }
    table
});

/// 频道代码的分类名，未知代码返回 `code:HHHH`
pub fn channel_category(code: u16) -> String {
    match CHANNEL_CATEGORIES.get(&code) {
        Some(name) => name.to_string(),
        None => format!("code:{:04X}", code),
    }
}

/// `HHHH:发言者:内容` 格式，HHHH 为十六进制频道代码
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCodeAnalyzer;

impl Analyzer for ChannelCodeAnalyzer {
    fn name(&self) -> &'static str {
        "channel_code"
    }

    fn analyze(&self, bytes: &[u8]) -> Result<Analysis> {
        let text = decode_utf8(bytes)?;
        let caps = ENTRY_PATTERN
            .captures(text)
            .ok_or_else(|| AppError::ParseError("条目缺少频道代码".to_string()))?;

        let code = u16::from_str_radix(&caps[1], 16)
            .map_err(|e| AppError::ParseError(format!("频道代码无效: {}", e)))?;

        Ok(Analysis {
            actor: caps[2].trim().to_string(),
            category: channel_category(code),
            message: caps[3].trim_end().to_string(),
        })
    }
}
