//! Twitch protocol layer: authentication, the GQL client, the PubSub
//! connection pool, and the minute-watched heartbeat.

pub mod api;
pub mod auth;
pub mod gql;
pub mod ws;

use rand::distributions::{Alphanumeric, DistString};
use rand::RngCore;

pub const TWITCH_URL: &str = "https://www.twitch.tv";
pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const INTEGRITY_URL: &str = "https://gql.twitch.tv/integrity";
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";
pub const LOGIN_URL: &str = "https://passport.twitch.tv/protected_login";
pub const DEVICE_CODE_URL: &str = "https://id.twitch.tv/oauth2/device";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

pub const CLIENT_ID: &str = "ue6666qo983tsx6so1t0vnawi233wa";
pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 7.1; Smart Box C1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

/// Fallback client build id used until the homepage scrape succeeds.
pub const CLIENT_VERSION: &str = "ef928475-9403-42f2-8a34-55784bd08e16";

/// Tag id marking streams with drops enabled.
pub const DROPS_TAG_ID: &str = "c2542d6d-cd10-4532-919b-3d19f30a768b";

pub const DEVICE_CODE_SCOPES: &str =
    "channel_read chat:read chat:edit user_read user:read:email";

/// A GQL operation: either a persisted query referenced by hash, or one of
/// the two directory queries Twitch only accepts inline.
#[derive(Debug, Clone, Copy)]
pub struct GqlOperation {
    pub name: &'static str,
    pub sha256: &'static str,
    pub query: &'static str,
}

impl GqlOperation {
    const fn persisted(name: &'static str, sha256: &'static str) -> GqlOperation {
        GqlOperation {
            name,
            sha256,
            query: "",
        }
    }

    const fn inline(name: &'static str, query: &'static str) -> GqlOperation {
        GqlOperation {
            name,
            sha256: "",
            query,
        }
    }
}

pub const OP_PLAYBACK_ACCESS_TOKEN: GqlOperation = GqlOperation::persisted(
    "PlaybackAccessToken",
    "3093517e37e4f4cb48906155bcd894150aef92617939236d2508f3375ab732ce",
);
pub const OP_STREAM_INFO: GqlOperation = GqlOperation::persisted(
    "VideoPlayerStreamInfoOverlayChannel",
    "a5f2e34d626a9f4f5c0204f910bab2194948a9502089be558bb6e779a9e1b3d2",
);
pub const OP_CLAIM_COMMUNITY_POINTS: GqlOperation = GqlOperation::persisted(
    "ClaimCommunityPoints",
    "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
);
pub const OP_CLAIM_MOMENT: GqlOperation = GqlOperation::persisted(
    "CommunityMomentCallout_Claim",
    "e2d67415aead910f7f9ceb45a77b750a1e1d9622c936d832328a0689e054db62",
);
pub const OP_CLAIM_DROP_REWARDS: GqlOperation = GqlOperation::persisted(
    "DropsPage_ClaimDropRewards",
    "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
);
pub const OP_CHANNEL_POINTS_CONTEXT: GqlOperation = GqlOperation::persisted(
    "ChannelPointsContext",
    "1530a003a7d374b0380b79db0be0534f30ff46e61cffa2bc0e2468a909fbc024",
);
pub const OP_JOIN_RAID: GqlOperation = GqlOperation::persisted(
    "JoinRaid",
    "c6a332a86d1087fbbb1a8623aa01bd1313d2386e7c63be60fdb2d1901f01a4ae",
);
pub const OP_MOD_VIEW_CHANNEL: GqlOperation = GqlOperation::persisted(
    "ModViewChannelQuery",
    "df5d55b6401389afb12d3017c9b2cf1237164220c8ef4ed754eae8188068a807",
);
pub const OP_INVENTORY: GqlOperation = GqlOperation::persisted(
    "Inventory",
    "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b",
);
pub const OP_MAKE_PREDICTION: GqlOperation = GqlOperation::persisted(
    "MakePrediction",
    "b44682ecc88358817009f20e69d75081b1e58825bb40aa53d5dbadcc17c881d8",
);
pub const OP_DROPS_DASHBOARD: GqlOperation = GqlOperation::persisted(
    "ViewerDropsDashboard",
    "5a4da2ab3d5b47c9f9ce864e727b2cb346af1e3ea8b897fe8f704a97ff017619",
);
pub const OP_DROP_CAMPAIGN_DETAILS: GqlOperation = GqlOperation::persisted(
    "DropCampaignDetails",
    "f6396f5ffdde867a8f6f6da18286e4baf02e5b98d14689a69b5af320a4c7b7b8",
);
pub const OP_AVAILABLE_DROPS: GqlOperation = GqlOperation::persisted(
    "DropsHighlightService_AvailableDrops",
    "9a62a09bce5b53e26e64a671e530bc599cb6aab1e5ba3cbd5d85966d3940716f",
);
pub const OP_GET_ID_FROM_LOGIN: GqlOperation = GqlOperation::persisted(
    "GetIDFromLogin",
    "94e82a7b1e3c21e186daa73ee2afc4b8f23bade1fbbff6fe8ac133f50a2f58ca",
);
pub const OP_CHANNEL_FOLLOWS: GqlOperation = GqlOperation::persisted(
    "ChannelFollows",
    "eecf815273d3d949e5cf0085cc5084cd8a1b5b7b6f7990cf43cb0beadf546907",
);
pub const OP_USER_POINTS_CONTRIBUTION: GqlOperation = GqlOperation::persisted(
    "UserPointsContribution",
    "23ff2c2d60708379131178742327ead913b93b1bd6f665517a6d9085b73f661f",
);
pub const OP_CONTRIBUTE_COMMUNITY_GOAL: GqlOperation = GqlOperation::persisted(
    "ContributeCommunityPointsCommunityGoal",
    "5774f0ea5d89587d73021a2e03c3c44777d903840c608754a1be519f51e37bb6",
);
pub const OP_DIRECTORY_PAGE_GAME: GqlOperation = GqlOperation::inline(
    "DirectoryPage_Game",
    "query DirectoryPage_Game($slug: String!, $first: Int!, $after: Cursor, $options: GameStreamOptions) { game(slug: $slug) { displayName name streams(first: $first, after: $after, options: $options) { edges { node { broadcaster { id login displayName } viewersCount title game { id name displayName slug } } cursor } pageInfo { hasNextPage } } } }",
);
pub const OP_GAME_BY_ID: GqlOperation =
    GqlOperation::inline("GameByID", "query GameByID($id: ID!) { game(id: $id) { slug } }");

/// Random hex string of `n_bytes * 2` characters, for nonces, session ids
/// and transaction ids.
pub fn generate_hex(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Random 32-character alphanumeric device id.
pub fn generate_device_id() -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), 32)
}

/// Walks a `.a.b.c`-style path through a JSON value.
pub fn traverse_json<'a>(
    mut value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    for key in path.split('.').filter(|s| !s.is_empty()) {
        value = value.get(key)?;
    }
    Some(value)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn hex_shapes() {
        let nonce = generate_hex(16);
        assert_eq!(nonce.len(), 32);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));

        let device = generate_device_id();
        assert_eq!(device.len(), 32);
        assert!(device.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn traverse_paths() {
        let data = json!({"a": {"b": {"c": 1}, "d": 2}});
        assert_eq!(traverse_json(&data, ".a.b.c"), Some(&json!(1)));
        assert_eq!(traverse_json(&data, ".a.d"), Some(&json!(2)));
        assert_eq!(traverse_json(&data, ".a.missing"), None);
        assert_eq!(traverse_json(&data, ""), Some(&data));
    }
}
