// Mirrors the table written by the ingestion tool.

diesel::table! {
    embeddings (id) {
        id -> Integer,
        chunk -> Text,
        embedding -> Binary,
    }
}
