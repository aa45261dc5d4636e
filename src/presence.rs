use serde::{Deserialize, Serialize};

pub const NUM_COLORS: u8 = 4;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypingStatus {
    Idle,
    ActiveTyping,
    IdleTyped,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub typing_status: TypingStatus,
    pub name: String,
    pub color_index: u8,
}

/// A connected participant, as written into the chat document's
/// `activeUsers`/`allUsers` maps.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Member {
    pub id: String,
    pub joined: i64,
    pub left: i64,
    pub info: MemberInfo,
    #[serde(skip)]
    seat: u64,
}

impl Member {
    pub fn seat(&self) -> u64 {
        self.seat
    }
}

/// Members currently connected to a channel.
#[derive(Default)]
pub struct Roster {
    members: Vec<Member>,
    color_counter: u8,
    next_seat: u64,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seats a new member and hands out the next color (1 through
    /// [`NUM_COLORS`], in join order).
    pub fn admit(&mut self, id: String, name: String, joined: i64) -> Member {
        let member = Member {
            id,
            joined,
            left: -1,
            info: MemberInfo {
                typing_status: TypingStatus::Idle,
                name,
                color_index: self.color_counter + 1,
            },
            seat: self.next_seat,
        };
        self.color_counter = (self.color_counter + 1) % NUM_COLORS;
        self.next_seat += 1;
        self.members.push(member.clone());
        member
    }

    pub fn remove(&mut self, seat: u64) -> Option<Member> {
        let pos = self.members.iter().position(|m| m.seat == seat)?;
        Some(self.members.remove(pos))
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}
