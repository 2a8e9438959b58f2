//! Plain-text session listing served on the stats port.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::session::SessionRegistry;

/// Write one line per live session, oldest id first.
pub async fn write_sessions<W: AsyncWrite + Unpin>(
    registry: &SessionRegistry,
    out: &mut W,
) -> std::io::Result<()> {
    let mut text = String::new();
    for snapshot in registry.snapshot() {
        text.push_str(&snapshot.to_string());
        text.push('\n');
    }
    out.write_all(text.as_bytes()).await?;
    out.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[tokio::test]
    async fn test_one_line_per_session() {
        let registry = SessionRegistry::new();
        let a = registry.register();
        a.begin(MessageType::CatV2, "seg0/x");
        a.add_bytes(42);
        let _b = registry.register();

        let mut out = Vec::new();
        write_sessions(&registry, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(&format!("{} | CAT V2 | seg0/x | 42 | ", a.id())));
        assert!(lines[1].contains("| IDLE |"));
    }
}
