//! ボットの返信文。

use chrono::NaiveDate;

pub const GREETING: &str = "Hi! I keep your diary: send me anything and I will file it under today's date.";
pub const UNAUTHENTICATED: &str = "Unfortunately, you are not authorized to use this bot";
pub const PLEASE_ENTER_CONTENT: &str = "Please enter content:";
pub const PLEASE_ENTER_DATE: &str = "Please enter the date that the content will be associated with:\n\nPlease use ISO format (e.g. 2021-07-29).";
pub const TRY_AGAIN_CHECK_VALIDITY: &str = "Please try again. Check that your input is correct.";
pub const SERVER_ERROR_AND_CANCELLED: &str =
    "Something went wrong! Operation has been cancelled. Please try again later.";
pub const STORE_UNAVAILABLE: &str =
    "The diary is not reachable right now. Nothing was changed, please try again in a moment.";
pub const CONFIRM_SAVE: &str = "Save this message to your diary?";
pub const YES: &str = "Yes";
pub const NO: &str = "No";
pub const CANCELLED: &str = "Cancelled";
pub const NOTHING_TO_CANCEL: &str = "There is nothing to cancel.";
pub const UPDATED: &str = "Your entry has been updated!";
pub const SELECT_CONTINENT: &str = "Please select a continent, or /cancel to cancel:";
pub const CONTINENT_INVALID: &str = "This continent is invalid. Please try again or /cancel.";
pub const SELECT_CITY: &str = "Please select your city timezone, or /cancel to cancel:";
pub const TIMEZONE_INVALID: &str = "This timezone is invalid. Please try again or /cancel.";

pub fn published(date: NaiveDate) -> String {
    format!("Your changes have been published for {}!", date.format("%Y-%m-%d"))
}

pub fn enter_content_for(date: NaiveDate) -> String {
    format!("Please enter content for {}:", date.format("%Y-%m-%d"))
}

pub fn timezone_set(timezone: &str) -> String {
    format!("Your timezone has been set to {timezone}.")
}

pub fn reminder(date: NaiveDate) -> String {
    format!(
        "Nothing in your diary for {} yet. How was your day?",
        date.format("%Y-%m-%d")
    )
}
