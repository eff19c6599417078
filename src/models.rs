use chrono::{NaiveDate, NaiveDateTime};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = tours)]
pub struct TourRow {
    pub id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: String,
    pub participant_count: i32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tours)]
pub struct NewTourRow {
    pub id: Uuid,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, QueryableByName, Identifiable, Associations)]
#[diesel(table_name = tour_participants)]
#[diesel(belongs_to(TourRow, foreign_key = tour_id))]
pub struct MembershipRow {
    pub id: Uuid,
    pub tour_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub status: String,
    pub requested_at: NaiveDateTime,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<NaiveDateTime>,
    pub rejection_reason: Option<String>,
    pub joined_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
