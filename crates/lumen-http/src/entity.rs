use bytes::BytesMut;

/// 有序的响应头集合。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 输出流在定稿元数据时需要回填 `Content-Length` 或
///   `Transfer-Encoding`，因此长度单独开槽，避免与普通头的字符串
///   表示来回转换。
///
/// ## 契约（What）
/// - 插入时头名归一化为连字符分段首字母大写（`content-length` →
///   `Content-Length`）；
/// - 同名头覆盖而不追加；序列化保持首次插入的顺序；
/// - `Content-Length` 始终走专用槽位，序列化时排在普通头之后。
#[derive(Debug, Default)]
pub struct Headers {
    items: Vec<(String, String)>,
    content_length: Option<u64>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// 设置一个头；`Content-Length` 被截获进专用槽位，非法数字忽略。
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let name = normalize_name(name);
        let value = value.into();
        if name == "Content-Length" {
            match value.trim().parse::<u64>() {
                Ok(length) => self.content_length = Some(length),
                Err(_) => {
                    tracing::warn!(target: "lumen::http", %value, "忽略非法的 Content-Length");
                }
            }
            return;
        }
        if let Some(slot) = self.items.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.items.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = normalize_name(name);
        if name == "Content-Length" {
            return None;
        }
        self.items
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.content_length.is_none()
    }

    /// 按插入顺序序列化为 `Name: value\r\n` 行；不含收尾空行。
    pub fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in &self.items {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if let Some(length) = self.content_length {
            buf.extend_from_slice(b"Content-Length: ");
            buf.extend_from_slice(length.to_string().as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// 连字符分段首字母大写，其余小写。
fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut start_of_token = true;
    for ch in name.chars() {
        if ch == '-' {
            out.push('-');
            start_of_token = true;
        } else if start_of_token {
            out.extend(ch.to_uppercase());
            start_of_token = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// 应用层响应实体：持有头集合并负责序列化状态行 + 头块。
///
/// 输出流只在定稿元数据时各调用一次 `headers`（回填长度/编码头）与
/// `write_metadata`（写出完整头块，含收尾空行）。
pub trait HttpEntity {
    fn headers(&mut self) -> &mut Headers;
    fn write_metadata(&mut self, buf: &mut BytesMut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_normalized_and_overwritten() {
        let mut headers = Headers::new();
        headers.set("content-type", "text/html");
        headers.set("CONTENT-TYPE", "application/json");
        assert_eq!(headers.get("Content-Type"), Some("application/json"));

        let mut buf = BytesMut::new();
        headers.write_to(&mut buf);
        assert_eq!(&buf[..], b"Content-Type: application/json\r\n");
    }

    #[test]
    fn content_length_uses_the_dedicated_slot() {
        let mut headers = Headers::new();
        headers.set("Content-Length", "42");
        assert_eq!(headers.content_length(), Some(42));
        headers.set("Content-Length", "not a number");
        assert_eq!(headers.content_length(), Some(42), "非法值不应覆盖");

        let mut buf = BytesMut::new();
        headers.write_to(&mut buf);
        assert_eq!(&buf[..], b"Content-Length: 42\r\n");
    }
}
