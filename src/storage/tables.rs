use redb::TableDefinition;

/// Upload records: upload id -> UploadRecord (msgpack)
pub const UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("uploads");

/// Report index: report_id -> msgpack Vec of upload ids
pub const REPORT_UPLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("report_uploads");
