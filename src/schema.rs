diesel::table! {
    alert_rules (id) {
        id -> Int8,
        address -> Int4,
        kind -> Text,
        active -> Bool,
        min -> Nullable<Float8>,
        max -> Nullable<Float8>,
        range_minutes -> Nullable<Int4>,
        delta -> Nullable<Float8>,
        sub_id -> Nullable<Int8>,
        logical_op -> Text,
        max_repeat_minutes -> Int4,
        last_alert_at -> Nullable<Timestamptz>,
        mail_to -> Text,
        subject -> Text,
        body -> Text,
    }
}

diesel::table! {
    device_errors (id) {
        id -> Int8,
        number -> Int4,
        info -> Int4,
        text -> Text,
        state -> Text,
        time1 -> Timestamptz,
        time2 -> Nullable<Timestamptz>,
        time4 -> Nullable<Timestamptz>,
        mail_count -> Int4,
    }
}

diesel::table! {
    menu_items (id) {
        id -> Int8,
        address -> Int4,
        parent -> Int4,
        child -> Int4,
        item_type -> Int4,
        title -> Text,
        unit -> Text,
        value -> Nullable<Text>,
    }
}

diesel::table! {
    peaks (address, kind) {
        address -> Int4,
        kind -> Text,
        min -> Float8,
        max -> Float8,
    }
}

diesel::table! {
    samples (time, address, kind, aggregate) {
        time -> Timestamptz,
        address -> Int4,
        kind -> Text,
        aggregate -> Text,
        value -> Float8,
        text -> Nullable<Text>,
        sample_count -> Int4,
    }
}

diesel::table! {
    time_ranges (address) {
        address -> Int4,
        from1 -> Nullable<Text>,
        to1 -> Nullable<Text>,
        from2 -> Nullable<Text>,
        to2 -> Nullable<Text>,
        from3 -> Nullable<Text>,
        to3 -> Nullable<Text>,
        from4 -> Nullable<Text>,
        to4 -> Nullable<Text>,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    value_facts (id) {
        id -> Int8,
        address -> Int4,
        kind -> Text,
        name -> Text,
        title -> Text,
        usr_title -> Nullable<Text>,
        unit -> Text,
        factor -> Int4,
        active -> Bool,
        group_id -> Nullable<Int4>,
        max_scale -> Nullable<Int4>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    alert_rules,
    device_errors,
    menu_items,
    peaks,
    samples,
    time_ranges,
    value_facts,
);
