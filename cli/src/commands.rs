//! Command handler for the interactive shell

use crate::ui;
use anyhow::{anyhow, bail, Context, Result};
use bftkv_core::protocol::{Message, MessageHeader};
use bftkv_core::{Client, CrdtType, Key};
use colored::Colorize;
use serde_json::Value;

pub struct CommandHandler {
    client: Client,
    current_key: Option<Key>,
}

impl CommandHandler {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            current_key: None,
        }
    }

    /// Short form of the current key, for the prompt
    pub fn prompt_key(&self) -> Option<String> {
        self.current_key.map(|k| k.to_hex()[..8].to_string())
    }

    pub async fn handle_command(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(());
        }

        match parts[0] {
            "ping" => self.cmd_ping().await,
            "new" => self.cmd_new(&parts[1..]).await,
            "use" => self.cmd_use(&parts[1..]),
            "get" => self.cmd_get(&parts[1..]).await,
            "inc" => self.cmd_amount(MessageHeader::Inc, &parts[1..]).await,
            "dec" => self.cmd_amount(MessageHeader::Dec, &parts[1..]).await,
            "add" => self.cmd_element(MessageHeader::Add, &parts[1..]).await,
            "rmv" => self.cmd_element(MessageHeader::Rmv, &parts[1..]).await,
            "connect" => self.cmd_connect(&parts[1..]).await,
            "raw" => self.cmd_raw(input).await,
            "context" => self.cmd_context(),
            "version" => self.cmd_version(),
            _ => {
                ui::print_error(&format!("Unknown command: {}", parts[0]));
                ui::print_info("Type 'help' for available commands");
                Ok(())
            }
        }
    }

    async fn cmd_ping(&mut self) -> Result<()> {
        self.client.ping().await?;
        ui::print_success("PONG");
        Ok(())
    }

    async fn cmd_new(&mut self, args: &[&str]) -> Result<()> {
        let crdt_type: CrdtType = args
            .first()
            .ok_or_else(|| anyhow!("Usage: new <counter|gset|2pset>"))?
            .parse()?;
        let key = self.client.new_key(crdt_type).await?;
        self.current_key = Some(key);
        ui::print_success(&format!("Created {} {}", crdt_type, key));
        Ok(())
    }

    fn cmd_use(&mut self, args: &[&str]) -> Result<()> {
        let key: Key = args
            .first()
            .ok_or_else(|| anyhow!("Usage: use <key>"))?
            .parse()?;
        self.current_key = Some(key);
        ui::print_info(&format!("Current key: {}", key));
        Ok(())
    }

    async fn cmd_get(&mut self, args: &[&str]) -> Result<()> {
        let (key, _) = self.split_key(args)?;
        let value = self.client.get(key).await?;
        ui::print_value(&value);
        Ok(())
    }

    async fn cmd_amount(&mut self, header: MessageHeader, args: &[&str]) -> Result<()> {
        let (key, rest) = self.split_key(args)?;
        let amount = parse_amount(rest.first().copied())
            .with_context(|| format!("Usage: {} [key] <n>", command_name(header)))?;

        match header {
            MessageHeader::Inc => self.client.inc(key, amount).await?,
            _ => self.client.dec(key, amount).await?,
        }
        ui::print_success(&format!("{} {}", command_name(header), amount));
        Ok(())
    }

    async fn cmd_element(&mut self, header: MessageHeader, args: &[&str]) -> Result<()> {
        let (key, rest) = self.split_key(args)?;
        if rest.is_empty() {
            bail!("Usage: {} [key] <json>", command_name(header));
        }
        let value = parse_value(&rest.join(" "));

        match header {
            MessageHeader::Add => self.client.add(key, value.clone()).await?,
            _ => self.client.rmv(key, value.clone()).await?,
        }
        ui::print_success(&format!("{} {}", command_name(header), value));
        Ok(())
    }

    async fn cmd_connect(&mut self, args: &[&str]) -> Result<()> {
        let (host, port) = match args {
            [host, port] => (*host, port.parse::<u16>().context("Invalid port")?),
            _ => bail!("Usage: connect <host> <port>"),
        };
        let peer = self.client.connect_peer(host, port).await?;
        ui::print_success(&format!("Linked to {}", peer));
        Ok(())
    }

    /// `raw <TAG> [body]` sends the body bytes exactly as typed
    async fn cmd_raw(&mut self, input: &str) -> Result<()> {
        let rest = input.trim_start().trim_start_matches("raw").trim_start();
        let (tag, body) = rest.split_once(' ').unwrap_or((rest, ""));
        let header = MessageHeader::parse(tag)
            .ok_or_else(|| anyhow!("A header tag is exactly 4 bytes, e.g. PING or /get"))?;

        let reply = self
            .client
            .request(Message::with_raw(header, body.trim().as_bytes().to_vec()))
            .await?;
        ui::print_reply(&reply);
        Ok(())
    }

    fn cmd_context(&self) -> Result<()> {
        println!();
        println!("{} {}", "Node:".bright_green(), self.client.peer());
        match self.current_key {
            Some(key) => println!("{} {}", "Key:".bright_green(), key),
            None => println!("{} {}", "Key:".bright_green(), "(none)".dimmed()),
        }
        println!();
        Ok(())
    }

    fn cmd_version(&self) -> Result<()> {
        println!();
        println!("{}", bftkv_core::version_string().bright_cyan().bold());
        println!("{} {}", "Protocol Version:".bright_green(), bftkv_core::PROTOCOL_VERSION);
        println!("{} {}", "Build:".bright_green(), bftkv_core::version::BUILD_PROFILE);
        println!();
        Ok(())
    }

    /// Leading argument is the key if it parses as one; otherwise the current key
    fn split_key<'a>(&self, args: &'a [&'a str]) -> Result<(Key, &'a [&'a str])> {
        if let Some(key) = args.first().and_then(|a| a.parse::<Key>().ok()) {
            return Ok((key, &args[1..]));
        }
        self.current_key
            .map(|key| (key, args))
            .ok_or_else(|| anyhow!("No key given and no current key; use 'new' or 'use <key>'"))
    }
}

fn command_name(header: MessageHeader) -> &'static str {
    match header {
        MessageHeader::Inc => "inc",
        MessageHeader::Dec => "dec",
        MessageHeader::Add => "add",
        _ => "rmv",
    }
}

/// Whole numbers, or decimals rounded the way the node rounds them
fn parse_amount(arg: Option<&str>) -> Result<i64> {
    let arg = arg.ok_or_else(|| anyhow!("Missing amount"))?;
    if let Ok(n) = arg.parse::<i64>() {
        return Ok(n);
    }
    let f: f64 = arg.parse().with_context(|| format!("Not a number: {}", arg))?;
    if !f.is_finite() {
        bail!("Not a finite number: {}", arg);
    }
    Ok(f.round() as i64)
}

/// JSON if it parses, otherwise the text as a string
fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value(r#"{"a": [1, 2]}"#), json!({"a": [1, 2]}));
        assert_eq!(parse_value("hello world"), json!("hello world"));
        assert_eq!(parse_value(r#""quoted""#), json!("quoted"));
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(Some("5")).unwrap(), 5);
        assert_eq!(parse_amount(Some("-2")).unwrap(), -2);
        assert_eq!(parse_amount(Some("2.6")).unwrap(), 3);
        assert!(parse_amount(Some("five")).is_err());
        assert!(parse_amount(Some("inf")).is_err());
        assert!(parse_amount(None).is_err());
    }
}
