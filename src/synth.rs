//! Builds the response bodies for intercepted requests.
//!
//! The proxy answers topology queries itself, advertising a single-node
//! cluster whose version and partitioner were learned from the backend at
//! boot. Everything here writes into growable buffers sized by the frame
//! being built.

use crate::backend::BootInfo;
use crate::constant::{RowsFlags, cql_type, result_kind};
use crate::error::{Error, Result};
use crate::parse::{Expr, Statement, SystemTable};
use crate::prepared::PREPARED_ID_SIZE;
use crate::protocol::primitive::{
    parse_inet, parse_uuid, write_collection, write_int32, write_short_bytes, write_string,
    write_string_list, write_uint16, write_value_bytes,
};

pub const CLUSTER_NAME: &str = "cql-proxy";
pub const CQL_VERSION: &str = "3.0.0";
pub const NATIVE_PROTOCOL_VERSION: &str = "4";
pub const DATA_CENTER: &str = "dc1";
pub const RACK: &str = "rack1";
pub const RPC_ADDRESS: &str = "127.0.0.1";

const SCHEMA_VERSION: &str = "4f2b29e6-59b5-4e2d-8fd6-01e32e67f0d7";
const HOST_ID: &str = "19e26944-ffb1-40a9-a184-a9b065e5e06b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub basic: u16,
    pub element: Option<u16>,
}

impl ColumnType {
    const fn simple(basic: u16) -> Self {
        Self {
            basic,
            element: None,
        }
    }

    const fn set(element: u16) -> Self {
        Self {
            basic: cql_type::SET,
            element: Some(element),
        }
    }
}

/// One column of a synthetic table schema.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ctype: ColumnType,
}

const fn col(name: &'static str, ctype: ColumnType) -> ColumnSpec {
    ColumnSpec { name, ctype }
}

pub const LOCAL_COLUMNS: [ColumnSpec; 12] = [
    col("key", ColumnType::simple(cql_type::VARCHAR)),
    col("rpc_address", ColumnType::simple(cql_type::INET)),
    col("data_center", ColumnType::simple(cql_type::VARCHAR)),
    col("rack", ColumnType::simple(cql_type::VARCHAR)),
    col("tokens", ColumnType::set(cql_type::VARCHAR)),
    col("release_version", ColumnType::simple(cql_type::VARCHAR)),
    col("partitioner", ColumnType::simple(cql_type::VARCHAR)),
    col("cluster_name", ColumnType::simple(cql_type::VARCHAR)),
    col("cql_version", ColumnType::simple(cql_type::VARCHAR)),
    col("schema_version", ColumnType::simple(cql_type::UUID)),
    col("native_protocol_version", ColumnType::simple(cql_type::VARCHAR)),
    col("host_id", ColumnType::simple(cql_type::UUID)),
];

pub const PEERS_COLUMNS: [ColumnSpec; 8] = [
    col("peer", ColumnType::simple(cql_type::INET)),
    col("data_center", ColumnType::simple(cql_type::VARCHAR)),
    col("rack", ColumnType::simple(cql_type::VARCHAR)),
    col("release_version", ColumnType::simple(cql_type::VARCHAR)),
    col("rpc_address", ColumnType::simple(cql_type::INET)),
    col("schema_version", ColumnType::simple(cql_type::UUID)),
    col("host_id", ColumnType::simple(cql_type::UUID)),
    col("tokens", ColumnType::set(cql_type::VARCHAR)),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Simple(Vec<u8>),
    Set(Vec<Vec<u8>>),
}

fn varchar_value(text: &str) -> Value {
    Value::Simple(text.as_bytes().to_vec())
}

fn int_value(value: i32) -> Value {
    Value::Simple(value.to_be_bytes().to_vec())
}

fn uuid_value(text: &str) -> Result<Value> {
    Ok(Value::Simple(parse_uuid(text)?.to_vec()))
}

fn inet_value(text: &str) -> Result<Value> {
    Ok(Value::Simple(parse_inet(text)?))
}

/// The single `system.local` row, in schema column order.
fn local_row(boot: &BootInfo) -> Result<Vec<Value>> {
    Ok(vec![
        varchar_value("local"),
        inet_value(RPC_ADDRESS)?,
        varchar_value(DATA_CENTER),
        varchar_value(RACK),
        Value::Set(vec![b"0".to_vec()]),
        varchar_value(&boot.release_version),
        varchar_value(&boot.partitioner),
        varchar_value(CLUSTER_NAME),
        varchar_value(CQL_VERSION),
        uuid_value(SCHEMA_VERSION)?,
        varchar_value(NATIVE_PROTOCOL_VERSION),
        uuid_value(HOST_ID)?,
    ])
}

/// Body of the SUPPORTED reply to OPTIONS.
pub fn supported_body() -> Vec<u8> {
    let mut out = Vec::new();
    write_uint16(&mut out, 2);
    write_string(&mut out, "CQL_VERSION");
    write_string_list(&mut out, &[CQL_VERSION]);
    write_string(&mut out, "COMPRESSION");
    write_string_list(&mut out, &[]);
    out
}

/// Body of an ERROR frame: int32 code + `[string]` message.
pub fn error_body(code: i32, message: &str) -> Vec<u8> {
    let mut truncated = message;
    if truncated.len() > u16::MAX as usize {
        let mut end = u16::MAX as usize;
        while !truncated.is_char_boundary(end) {
            end -= 1;
        }
        truncated = &truncated[..end];
    }
    let mut out = Vec::with_capacity(4 + 2 + truncated.len());
    write_int32(&mut out, code);
    write_string(&mut out, truncated);
    out
}

/// Body of a RESULT/Set_Keyspace frame.
pub fn set_keyspace_body(keyspace: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_int32(&mut out, result_kind::SET_KEYSPACE);
    write_string(&mut out, keyspace);
    out
}

/// An owned column description; aliases rename schema columns here.
#[derive(Debug, Clone)]
struct Column {
    name: String,
    ctype: ColumnType,
}

fn schema(table: SystemTable) -> Result<(&'static str, &'static [ColumnSpec])> {
    match table {
        SystemTable::Local => Ok(("local", &LOCAL_COLUMNS)),
        SystemTable::Peers => Ok(("peers", &PEERS_COLUMNS)),
        SystemTable::PeersV2 => Err(Error::InvalidQuery("Doesn't exist")),
    }
}

/// Map select-list expressions onto schema column indexes, applying aliases.
fn resolve_projection(exprs: &[Expr], columns: &[ColumnSpec]) -> Result<Vec<(usize, Column)>> {
    let mut out = Vec::with_capacity(exprs.len());
    for expr in exprs {
        let (name, display) = match expr {
            Expr::Id(name) => (name.as_str(), name.as_str()),
            Expr::Alias { name, alias } => (name.as_str(), alias.as_str()),
            Expr::Star | Expr::Count => return Err(Error::InvalidQuery("Invalid column name")),
        };
        let index = columns
            .iter()
            .position(|column| column.name == name)
            .ok_or(Error::InvalidQuery("Invalid column name"))?;
        out.push((
            index,
            Column {
                name: display.to_string(),
                ctype: columns[index].ctype,
            },
        ));
    }
    Ok(out)
}

fn count_column() -> Column {
    Column {
        name: "count".to_string(),
        ctype: ColumnType::simple(cql_type::INT),
    }
}

/// Body of a RESULT/Rows frame for an intercepted SELECT.
pub fn rows_body(
    exprs: &[Expr],
    table: SystemTable,
    skip_metadata: bool,
    boot: &BootInfo,
) -> Result<Vec<u8>> {
    let (table_name, columns) = schema(table)?;
    let row = match table {
        SystemTable::Local => Some(local_row(boot)?),
        _ => None,
    };

    let mut out = Vec::new();
    match exprs.first() {
        None => return Err(Error::InvalidQuery("Invalid select expressions")),
        Some(Expr::Star) => {
            let full: Vec<Column> = columns
                .iter()
                .map(|c| Column {
                    name: c.name.to_string(),
                    ctype: c.ctype,
                })
                .collect();
            let rows: Vec<Vec<Value>> = row.into_iter().collect();
            encode_rows(&mut out, skip_metadata, table_name, &full, &rows);
        }
        Some(Expr::Count) => {
            let count = match table {
                SystemTable::Local => 1,
                _ => 0,
            };
            encode_rows(
                &mut out,
                skip_metadata,
                table_name,
                &[count_column()],
                &[vec![int_value(count)]],
            );
        }
        Some(_) => {
            let selected = resolve_projection(exprs, columns)?;
            let cols: Vec<Column> = selected.iter().map(|(_, c)| c.clone()).collect();
            let rows: Vec<Vec<Value>> = row
                .into_iter()
                .map(|values| {
                    selected
                        .iter()
                        .map(|(index, _)| values[*index].clone())
                        .collect()
                })
                .collect();
            encode_rows(&mut out, skip_metadata, table_name, &cols, &rows);
        }
    }
    Ok(out)
}

/// Body of a RESULT/Prepared frame for an intercepted PREPARE.
pub fn prepared_body(id: &[u8; PREPARED_ID_SIZE], stmt: &Statement) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match stmt {
        Statement::Use { .. } => encode_prepared(&mut out, id, "", "", &[]),
        Statement::Select { table, exprs, .. } => {
            let (table_name, columns) = schema(*table)?;
            let result_columns: Vec<Column> = match exprs.first() {
                None => return Err(Error::InvalidQuery("Invalid select expressions")),
                Some(Expr::Star) => columns
                    .iter()
                    .map(|c| Column {
                        name: c.name.to_string(),
                        ctype: c.ctype,
                    })
                    .collect(),
                Some(Expr::Count) => vec![count_column()],
                Some(_) => resolve_projection(exprs, columns)?
                    .into_iter()
                    .map(|(_, c)| c)
                    .collect(),
            };
            encode_prepared(&mut out, id, "system", table_name, &result_columns);
        }
    }
    Ok(out)
}

fn encode_column_type(out: &mut Vec<u8>, ctype: &ColumnType) {
    write_uint16(out, ctype.basic);
    if let Some(element) = ctype.element {
        write_uint16(out, element);
    }
}

fn encode_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => write_int32(out, -1),
        Value::Simple(bytes) => write_value_bytes(out, Some(bytes)),
        Value::Set(elements) => write_collection(out, elements),
    }
}

fn encode_rows(
    out: &mut Vec<u8>,
    skip_metadata: bool,
    table: &str,
    columns: &[Column],
    rows: &[Vec<Value>],
) {
    write_int32(out, result_kind::ROWS);
    if skip_metadata {
        write_int32(out, RowsFlags::NO_METADATA.bits());
        write_int32(out, columns.len() as i32);
    } else {
        write_int32(out, RowsFlags::GLOBAL_TABLESPEC.bits());
        write_int32(out, columns.len() as i32);
        write_string(out, "system");
        write_string(out, table);
        for column in columns {
            write_string(out, &column.name);
            encode_column_type(out, &column.ctype);
        }
    }
    write_int32(out, rows.len() as i32);
    for row in rows {
        for value in row {
            encode_value(out, value);
        }
    }
}

fn encode_prepared(
    out: &mut Vec<u8>,
    id: &[u8; PREPARED_ID_SIZE],
    keyspace: &str,
    table: &str,
    columns: &[Column],
) {
    write_int32(out, result_kind::PREPARED);
    write_short_bytes(out, id);

    // Bind-marker metadata: no markers, no primary-key indexes.
    write_int32(out, RowsFlags::GLOBAL_TABLESPEC.bits());
    write_int32(out, 0);
    write_int32(out, 0);
    write_string(out, keyspace);
    write_string(out, table);

    // Result metadata.
    write_int32(out, RowsFlags::GLOBAL_TABLESPEC.bits());
    write_int32(out, columns.len() as i32);
    write_string(out, keyspace);
    write_string(out, table);
    for column in columns {
        write_string(out, &column.name);
        encode_column_type(out, &column.ctype);
    }
}
