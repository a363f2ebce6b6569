use crate::cache::CacheEntry;

/// User-facing reply texts. Every message gets the optional follow footer.
#[derive(Debug, Clone, Default)]
pub struct Messages {
    follow_url: Option<String>,
}

impl Messages {
    pub fn new(follow_url: Option<String>) -> Self {
        Self { follow_url }
    }

    fn finish(&self, body: String) -> String {
        match &self.follow_url {
            Some(url) => format!("{body}\n\n📲 *Follow:* {url}"),
            None => body,
        }
    }

    pub fn welcome(&self, max_file_size_mb: u64, concurrency: usize) -> String {
        self.finish(format!(
            "🤖 *App download bot*\n\n\
             Send the name of any app to download it 📱\n\
             Examples: whatsapp, free fire, pubg\n\n\
             ✅ APK and XAPK supported\n\
             ✅ Files up to {max_file_size_mb}MB\n\
             ⚡ {concurrency}+ concurrent users"
        ))
    }

    pub fn details(&self, entry: &CacheEntry) -> String {
        self.finish(format!(
            "📦 *App details*\n\n📱 {}\n🔢 {}\n💾 {}\n⭐ {}\n\n⏳ Sending...",
            entry.display_name,
            entry.version,
            entry.human_size(),
            entry.rating.as_deref().unwrap_or("N/A"),
        ))
    }

    pub fn too_large(&self, entry: &CacheEntry, max_file_size_mb: u64) -> String {
        self.finish(format!(
            "⚠️ *File too large!*\n\n📱 {}\n💾 {}\n⚠️ Limit: {max_file_size_mb}MB",
            entry.display_name,
            entry.human_size(),
        ))
    }

    pub fn link_only(&self, entry: &CacheEntry, url: &str) -> String {
        self.finish(format!("🔗 *{}*\n\n{url}", entry.display_name))
    }

    pub fn xapk_instructions(&self) -> String {
        self.finish(
            "📦 *XAPK file*\n\n\
             ⚠️ Contains extra data (OBB)\n\n\
             *How to install:*\n\
             1️⃣ Get an XAPK installer from the store\n\
             2️⃣ Open it and pick this file\n\
             3️⃣ Tap install"
                .to_string(),
        )
    }

    pub fn not_found(&self, reason: &str) -> String {
        self.finish(format!("❌ {reason}"))
    }

    pub fn unreachable(&self) -> String {
        self.finish("❌ The download server is unreachable right now. Please try again shortly.".to_string())
    }

    pub fn file_missing(&self) -> String {
        self.finish("❌ Could not find the downloaded file".to_string())
    }

    pub fn generic_failure(&self) -> String {
        self.finish("❌ Something went wrong while handling your request".to_string())
    }
}
