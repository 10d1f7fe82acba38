fn main() {
    // the schema is embedded at compile time via sqlx::migrate!
    println!("cargo:rerun-if-changed=migrations");
}
