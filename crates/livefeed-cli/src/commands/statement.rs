//! Print the statement `subscribe` would send, without connecting

use anyhow::{Context, Result};
use clap::Args;
use livefeed_core::{SubscribeRequest, Timestamp};

#[derive(Args, Debug)]
pub struct StatementArgs {
    /// Inner query
    pub query: String,

    /// Upsert key column (repeat for a composite key)
    #[arg(short, long = "key", required = true)]
    pub keys: Vec<String>,

    /// Lower bound as a logical timestamp (ms since epoch)
    #[arg(long)]
    pub as_of_at_least: Option<u64>,
}

pub fn render(args: &StatementArgs) -> Result<String> {
    let mut request = SubscribeRequest::new(args.query.clone(), args.keys.clone())
        .context("Invalid subscription")?;
    if let Some(ms) = args.as_of_at_least {
        request = request.as_of_at_least(Timestamp::from_millis(ms));
    }
    Ok(request.statement()?)
}

pub fn run(args: StatementArgs) -> Result<()> {
    println!("{}", render(&args)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(query: &str, keys: &[&str], as_of_at_least: Option<u64>) -> StatementArgs {
        StatementArgs {
            query: query.to_string(),
            keys: keys.iter().map(|k| k.to_string()).collect(),
            as_of_at_least,
        }
    }

    #[test]
    fn test_render() {
        let sql = render(&args("SELECT * FROM t;", &["id"], None)).unwrap();
        assert_eq!(
            sql,
            r#"SUBSCRIBE (SELECT * FROM t) WITH (PROGRESS) ENVELOPE UPSERT (KEY ("id"));"#
        );
    }

    #[test]
    fn test_render_rejects_blank_query() {
        let err = render(&args(" ", &["id"], None)).unwrap_err();
        assert!(format!("{err:#}").contains("empty"));
    }
}
