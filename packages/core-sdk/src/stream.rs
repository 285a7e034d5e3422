use std::{fmt::Display, pin::Pin};

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::{
    error::ProxyError,
    vendor::{StreamLine, Vendor},
};

/** \brief HTML 生成场景下的默认终止标记。 */
pub const HTML_CLOSING_MARKER: &str = "</html>";

/**
 * \brief 规范化后的文本片段流：惰性、单向、不可重启。
 */
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProxyError>> + Send>>;

/**
 * \brief 内容级提前终止条件。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCondition {
    /** \brief 只在上游结束时终止 */
    Never,
    /** \brief 已输出内容中出现该标记后立即终止 */
    Marker(String),
}

impl Default for StopCondition {
    fn default() -> Self {
        StopCondition::Marker(HTML_CLOSING_MARKER.to_string())
    }
}

/**
 * \brief 跟踪已输出内容的尾部窗口，标记跨片段也能识别。
 */
struct StopWatch {
    marker: Option<String>,
    tail: String,
}

impl StopWatch {
    fn new(condition: StopCondition) -> Self {
        let marker = match condition {
            StopCondition::Never => None,
            StopCondition::Marker(m) if m.is_empty() => None,
            StopCondition::Marker(m) => Some(m),
        };
        Self {
            marker,
            tail: String::new(),
        }
    }

    fn observe(&mut self, fragment: &str) -> bool {
        let Some(marker) = &self.marker else {
            return false;
        };
        self.tail.push_str(fragment);
        let found = self.tail.contains(marker.as_str());
        if self.tail.len() > marker.len() {
            let mut cut = self.tail.len() - marker.len();
            while !self.tail.is_char_boundary(cut) {
                cut -= 1;
            }
            self.tail.drain(..cut);
        }
        found
    }
}

/**
 * \brief 按换行切分字节流；只对完整行做 UTF-8 解码，多字节字符跨块也安全。
 */
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(decode(&raw[..raw.len() - 1]));
        }
        lines
    }

    fn finish(&mut self) -> Vec<String> {
        if self.buf.is_empty() {
            return Vec::new();
        }
        let rest = std::mem::take(&mut self.buf);
        vec![decode(&rest)]
    }
}

fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\r')
        .to_string()
}

/**
 * \brief 将厂商特定的增量响应转换为统一的文本片段序列。
 *
 * 上游结束、厂商结束标记或命中终止条件时结束；单行解析失败只记录并跳过。
 */
pub fn normalize<S, B, E>(vendor: Vendor, upstream: S, stop: StopCondition) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let adapter = vendor.adapter();
    let out = stream! {
        let mut upstream = Box::pin(upstream);
        let mut lines = LineBuffer::default();
        let mut watch = StopWatch::new(stop);
        loop {
            let (batch, exhausted) = match upstream.next().await {
                Some(Ok(chunk)) => (lines.push(chunk.as_ref()), false),
                Some(Err(err)) => {
                    warn!(vendor = %vendor, error = %err, "upstream stream failed");
                    yield Err(ProxyError::Stream(err.to_string()));
                    return;
                }
                None => (lines.finish(), true),
            };
            for line in batch {
                if line.trim().is_empty() {
                    continue;
                }
                match adapter.extract_stream_fragment(&line) {
                    Ok(StreamLine::Fragment(text)) => {
                        let stop_now = watch.observe(&text);
                        yield Ok(text);
                        if stop_now {
                            debug!(vendor = %vendor, "stop marker reached, releasing upstream");
                            return;
                        }
                    }
                    Ok(StreamLine::Skip) => {}
                    Ok(StreamLine::Done) => {
                        debug!(vendor = %vendor, "upstream signalled completion");
                        return;
                    }
                    Err(err) => {
                        warn!(vendor = %vendor, error = %err, "skipping malformed stream line");
                    }
                }
            }
            if exhausted {
                return;
            }
        }
    };
    Box::pin(out)
}

/**
 * \brief 消费整个片段流并拼接为完整文本（CLI 与测试使用）。
 */
pub async fn collect_text(mut fragments: FragmentStream) -> Result<String, ProxyError> {
    let mut out = String::new();
    while let Some(fragment) = fragments.next().await {
        out.push_str(&fragment?);
    }
    Ok(out)
}
