//! Best-effort recognizer for intercept-worthy statements.
//!
//! The parser never rejects a query: anything it cannot classify returns
//! `None` and the raw frame is forwarded to the backend unchanged.

use crate::lex::{Lexer, Token};

/// Select-list items beyond this are parsed but not retained.
pub const MAX_SELECT_EXPRS: usize = 20;

/// Longest keyspace name accepted by `USE`; the backend rejects longer ones
/// anyway, so oversized names fall through to forwarding.
pub const MAX_KEYSPACE: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTable {
    Local,
    Peers,
    PeersV2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Star,
    Count,
    Id(String),
    Alias { name: String, alias: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select {
        table: SystemTable,
        /// True when the FROM clause named `system.<table>` explicitly;
        /// a bare table name resolves against the session keyspace instead.
        is_table: bool,
        exprs: Vec<Expr>,
    },
    Use {
        keyspace: String,
    },
}

pub fn parse(query: &str) -> Option<Statement> {
    let mut lex = Lexer::new(query);
    match lex.next_token() {
        Token::Select => parse_select(&mut lex),
        Token::Use => parse_use(&mut lex),
        _ => None,
    }
}

fn parse_select(lex: &mut Lexer<'_>) -> Option<Statement> {
    // First pass: skip ahead to FROM, treating the select-list as opaque.
    lex.mark();
    loop {
        match lex.next_token() {
            Token::From => break,
            Token::Eof => return None,
            _ => {}
        }
    }

    let (table, is_table) = match lex.next_token() {
        Token::System => {
            if lex.next_token() != Token::Dot {
                return None;
            }
            (system_table(lex.next_token())?, true)
        }
        token => (system_table(token)?, false),
    };

    // Second pass: walk the select-list now that the target is known.
    lex.rewind();
    let exprs = parse_select_exprs(lex)?;

    Some(Statement::Select {
        table,
        is_table,
        exprs,
    })
}

fn system_table(token: Token) -> Option<SystemTable> {
    match token {
        Token::Local => Some(SystemTable::Local),
        Token::Peers => Some(SystemTable::Peers),
        Token::PeersV2 => Some(SystemTable::PeersV2),
        _ => None,
    }
}

fn parse_select_exprs(lex: &mut Lexer<'_>) -> Option<Vec<Expr>> {
    let mut exprs = Vec::new();

    let mut token = lex.next_token();
    // An empty select-list parses; the synthesizer rejects it later.
    if token == Token::From {
        return Some(exprs);
    }

    loop {
        let expr = parse_select_expr(lex, token)?;
        if exprs.len() < MAX_SELECT_EXPRS {
            exprs.push(expr);
        }

        match lex.next_token() {
            Token::From => return Some(exprs),
            Token::Comma => token = lex.next_token(),
            _ => return None,
        }
    }
}

fn parse_select_expr(lex: &mut Lexer<'_>, token: Token) -> Option<Expr> {
    match token {
        Token::Star => Some(Expr::Star),
        Token::Count => {
            if lex.next_token() != Token::LParen {
                return None;
            }
            match lex.next_token() {
                Token::Star | Token::Id => {}
                _ => return None,
            }
            if lex.next_token() != Token::RParen {
                return None;
            }
            Some(Expr::Count)
        }
        Token::Id => {
            let name = lex.value().to_string();
            lex.mark();
            if lex.next_token() == Token::As {
                if lex.next_token() != Token::Id {
                    return None;
                }
                Some(Expr::Alias {
                    name,
                    alias: lex.value().to_string(),
                })
            } else {
                lex.rewind();
                Some(Expr::Id(name))
            }
        }
        _ => None,
    }
}

fn parse_use(lex: &mut Lexer<'_>) -> Option<Statement> {
    match lex.next_token() {
        Token::System | Token::Id => {}
        _ => return None,
    }
    let keyspace = lex.value().to_string();
    if keyspace.is_empty() || keyspace.len() > MAX_KEYSPACE {
        return None;
    }
    Some(Statement::Use { keyspace })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn select_star_from_system_local() {
        assert_eq!(
            parse("SELECT * FROM system.local"),
            Some(Statement::Select {
                table: SystemTable::Local,
                is_table: true,
                exprs: vec![Expr::Star],
            })
        );
    }

    #[test]
    fn select_with_alias_and_plain_id() {
        assert_eq!(
            parse("select release_version as v, partitioner from system.local"),
            Some(Statement::Select {
                table: SystemTable::Local,
                is_table: true,
                exprs: vec![
                    Expr::Alias {
                        name: "release_version".into(),
                        alias: "v".into(),
                    },
                    Expr::Id("partitioner".into()),
                ],
            })
        );
    }

    #[test]
    fn select_count_star_from_peers() {
        assert_eq!(
            parse("SELECT COUNT(*) FROM system.peers"),
            Some(Statement::Select {
                table: SystemTable::Peers,
                is_table: true,
                exprs: vec![Expr::Count],
            })
        );
    }

    #[test]
    fn count_of_column() {
        assert_eq!(
            parse("SELECT COUNT(host_id) FROM system.peers"),
            Some(Statement::Select {
                table: SystemTable::Peers,
                is_table: true,
                exprs: vec![Expr::Count],
            })
        );
    }

    #[test]
    fn use_statement() {
        assert_eq!(
            parse("USE myks"),
            Some(Statement::Use {
                keyspace: "myks".into(),
            })
        );
        // `system` is a keyword but still a valid keyspace name.
        assert_eq!(
            parse("use system"),
            Some(Statement::Use {
                keyspace: "system".into(),
            })
        );
    }

    #[test]
    fn unrelated_statements_fail() {
        assert_eq!(parse("INSERT INTO t VALUES (1)"), None);
        assert_eq!(parse("SELECT * FROM app.users"), None);
        assert_eq!(parse("BEGIN BATCH APPLY BATCH"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn bare_table_name_is_not_qualified() {
        assert_eq!(
            parse("SELECT * FROM local"),
            Some(Statement::Select {
                table: SystemTable::Local,
                is_table: false,
                exprs: vec![Expr::Star],
            })
        );
        assert_eq!(
            parse("SELECT * FROM peers_v2"),
            Some(Statement::Select {
                table: SystemTable::PeersV2,
                is_table: false,
                exprs: vec![Expr::Star],
            })
        );
    }

    #[test]
    fn peers_v2_qualified() {
        assert_eq!(
            parse("SELECT * FROM system.peers_v2"),
            Some(Statement::Select {
                table: SystemTable::PeersV2,
                is_table: true,
                exprs: vec![Expr::Star],
            })
        );
    }

    #[test]
    fn keyword_in_select_list_scan_is_opaque() {
        // The first pass skips anything before FROM, so this parses; the
        // second pass then sees an empty select-list.
        assert_eq!(
            parse("SELECT FROM system.local"),
            Some(Statement::Select {
                table: SystemTable::Local,
                is_table: true,
                exprs: vec![],
            })
        );
        // A keyword as a select item fails the second pass instead.
        assert_eq!(parse("SELECT local FROM system.local"), None);
        // The scan stops at the first FROM, so a doubled FROM reads as a
        // failed table name and the whole statement is forwarded.
        assert_eq!(parse("SELECT FROM FROM system.local"), None);
    }

    #[test]
    fn excess_exprs_are_dropped() {
        let list = (0..25).map(|i| format!("c{i}")).collect::<Vec<_>>();
        let query = format!("SELECT {} FROM system.local", list.join(", "));
        let Some(Statement::Select { exprs, .. }) = parse(&query) else {
            panic!("expected select");
        };
        assert_eq!(exprs.len(), MAX_SELECT_EXPRS);
        assert_eq!(exprs[0], Expr::Id("c0".into()));
    }

    #[test]
    fn malformed_select_lists_fail() {
        assert_eq!(parse("SELECT a,, FROM system.local"), None);
        assert_eq!(parse("SELECT COUNT(* FROM system.local"), None);
        assert_eq!(parse("SELECT a AS FROM system.local"), None);
        assert_eq!(parse("SELECT a b FROM system.local"), None);
    }

    #[test]
    fn use_rejects_garbage_and_oversized_names() {
        assert_eq!(parse("USE *"), None);
        assert_eq!(parse("USE"), None);
        let long = "k".repeat(MAX_KEYSPACE + 1);
        assert_eq!(parse(&format!("USE {long}")), None);
    }
}
